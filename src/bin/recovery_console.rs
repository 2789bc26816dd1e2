fn main() -> anyhow::Result<()> {
    proctor_kernel::console::run()
}
