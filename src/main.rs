use anyhow::Context;

fn main() -> anyhow::Result<()> {
    let code = carapace::run().context("carapace failed")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
