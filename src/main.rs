fn main() {
    if let Err(err) = swiss_knockout_lib::run() {
        eprintln!("swiss-knockout: {err}");
        std::process::exit(1);
    }
}
