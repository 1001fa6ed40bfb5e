//! `crew` - run and follow coding agents through the crew daemon.
//!
//! See `crew --help`; the command line lives in `crew_client::cli`.

fn main() -> anyhow::Result<()> {
    crew_client::cli::run()
}
