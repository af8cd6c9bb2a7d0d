fn main() {
    let code = match kiln::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("kiln: error: {}", err);
            1
        }
    };
    std::process::exit(code);
}
