use qtc_ledger::cli::run_cli;

fn main() -> anyhow::Result<()> {
    // Logging is initialized in run_cli based on the debug flag
    run_cli()
}
