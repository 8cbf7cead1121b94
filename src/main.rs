fn main() -> anyhow::Result<()> {
    my_note::cli::run()
}
