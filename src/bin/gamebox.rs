use anyhow::Result;

fn main() -> Result<()> {
    gamebox::cli::run()
}
