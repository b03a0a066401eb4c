fn main() {
    if let Err(err) = ingest_shape::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
