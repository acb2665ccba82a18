pub fn run() -> anyhow::Result<()> {
    println!("kube-rightsize {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
