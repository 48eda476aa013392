fn main() {
    let exit_code = match grist::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("grist: error: {}", err);
            2
        }
    };
    std::process::exit(exit_code);
}
