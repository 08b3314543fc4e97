use anyhow::Result;
use wattbill_cli::app;

fn main() -> Result<()> {
    app::run()
}
