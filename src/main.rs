fn main() -> anyhow::Result<()> {
    uart_link_lib::run()
}
