fn main() {
    let exit_code = match corebuild::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("corebuild: error: {}", err);
            1
        }
    };
    std::process::exit(exit_code);
}
