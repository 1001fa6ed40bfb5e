//! `crew` - run and follow coding agents through the crew daemon.

fn main() -> anyhow::Result<()> {
    crew_client::cli::run()
}
