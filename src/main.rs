use std::process::exit;

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let code = bptvec::cli::run(&argv);
    exit(code);
}
