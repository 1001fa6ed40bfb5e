fn main() -> anyhow::Result<()> {
    crewd::cli::run()
}
