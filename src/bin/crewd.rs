//! crew daemon - agent session registry and socket server.
//!
//! See `crewd --help`; the command line lives in `crewd::cli`.

fn main() -> anyhow::Result<()> {
    crewd::cli::run()
}
