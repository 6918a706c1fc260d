use anyhow::Result;

fn main() -> Result<()> {
    benchtool_cli::cli::execute()
}
