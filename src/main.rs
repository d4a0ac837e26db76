use std::process;

fn main() {
    if let Err(err) = stratus::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
