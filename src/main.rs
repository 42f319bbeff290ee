fn main() {
    if let Err(e) = offsync::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
