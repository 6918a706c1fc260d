//! Consistent hashing of series onto ring instances.
//!
//! Series are sharded by a 32-bit FNV-1a hash over the tenant and all labels of the series. The
//! owners of a token are looked up through the [`Ring`] trait. [`TokenRing`] is an in-process
//! ring built from a static list of instances, used to predict the shard distribution of a
//! workload.

use std::collections::BTreeSet;
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::write::proto::Label;

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// Adds the bytes of `s` to a running FNV-1a hash.
pub fn fnv_add(mut hash: u32, s: &str) -> u32 {
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Computes the shard token of a series from its labels in the given order.
///
/// The hash is sensitive to label order. Use [`shard_token_sorted`] unless the labels are known
/// to be sorted by name.
pub fn shard_token(tenant: &str, labels: &[Label]) -> u32 {
    let mut hash = fnv_add(FNV_OFFSET, tenant);
    for label in labels {
        hash = fnv_add(hash, &label.name);
        hash = fnv_add(hash, &label.value);
    }
    hash
}

/// Computes the shard token of a series after sorting its labels by name.
pub fn shard_token_sorted(tenant: &str, labels: &[Label]) -> u32 {
    let mut sorted: Vec<&Label> = labels.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hash = fnv_add(FNV_OFFSET, tenant);
    for label in sorted {
        hash = fnv_add(hash, &label.name);
        hash = fnv_add(hash, &label.value);
    }
    hash
}

/// Errors looking up tokens in a ring.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The ring has no instances or tokens.
    #[error("empty ring")]
    Empty,
    /// The replication factor is zero.
    #[error("replication factor must be greater than zero")]
    ZeroReplicationFactor,
}

/// The instances owning a token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationSet {
    /// Instance addresses in ring order, starting with the primary owner.
    pub instances: Vec<String>,
}

/// A consistent-hashing ring.
pub trait Ring: fmt::Debug + Send + Sync {
    /// Returns the instances owning `token`.
    fn get(&self, token: u32) -> Result<ReplicationSet, RingError>;
}

/// A ring member.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceDesc {
    /// Address of the instance.
    pub addr: String,
    /// Tokens owned by the instance. Generated from the address if empty.
    #[serde(default)]
    pub tokens: Vec<u32>,
}

/// Generates `count` distinct tokens deterministically from an instance address.
///
/// The same address yields the same tokens on every platform and release.
pub fn generate_tokens(addr: &str, count: usize) -> Vec<u32> {
    let seed = adler2::adler32_slice(addr.as_bytes());
    let mut rng = ChaCha8Rng::seed_from_u64(u64::from(seed));

    let mut tokens = BTreeSet::new();
    while tokens.len() < count {
        tokens.insert(rng.random::<u32>());
    }
    tokens.into_iter().collect()
}

/// A static in-process ring.
#[derive(Clone, Debug)]
pub struct TokenRing {
    /// Sorted tokens with the index of the owning instance.
    tokens: Vec<(u32, usize)>,
    instances: Vec<String>,
    replication_factor: usize,
}

impl TokenRing {
    /// Builds a ring from its instances.
    ///
    /// Instances without explicit tokens get `num_tokens` tokens generated from their address. A
    /// token claimed by multiple instances belongs to the first of them.
    pub fn new(
        instances: Vec<InstanceDesc>,
        replication_factor: usize,
        num_tokens: usize,
    ) -> Result<Self, RingError> {
        if replication_factor == 0 {
            return Err(RingError::ZeroReplicationFactor);
        }

        let mut tokens = Vec::new();
        let mut addrs = Vec::with_capacity(instances.len());

        for (index, instance) in instances.into_iter().enumerate() {
            let instance_tokens = if instance.tokens.is_empty() {
                generate_tokens(&instance.addr, num_tokens)
            } else {
                instance.tokens
            };

            tokens.extend(instance_tokens.into_iter().map(|token| (token, index)));
            addrs.push(instance.addr);
        }

        if tokens.is_empty() {
            return Err(RingError::Empty);
        }

        tokens.sort();
        tokens.dedup_by_key(|(token, _)| *token);

        Ok(Self {
            tokens,
            instances: addrs,
            replication_factor,
        })
    }

    /// The addresses of all instances.
    pub fn instances(&self) -> &[String] {
        &self.instances
    }
}

impl Ring for TokenRing {
    fn get(&self, key: u32) -> Result<ReplicationSet, RingError> {
        if self.tokens.is_empty() {
            return Err(RingError::Empty);
        }

        let start = self.tokens.partition_point(|(token, _)| *token < key);
        let mut owners: Vec<usize> = Vec::with_capacity(self.replication_factor);

        for offset in 0..self.tokens.len() {
            if owners.len() == self.replication_factor {
                break;
            }

            let (_, owner) = self.tokens[(start + offset) % self.tokens.len()];
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }

        Ok(ReplicationSet {
            instances: owners
                .into_iter()
                .map(|owner| self.instances[owner].clone())
                .collect(),
        })
    }
}
