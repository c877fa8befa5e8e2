/// limitbox: run a command under CPU and memory limits
///
/// # Usage
/// ```bash
/// limitbox --cpu 50 --memory 512M -- stress --cpu 2 --timeout 10
/// limitbox --name build --existing make -j8
/// ```
fn main() {
    env_logger::init();

    let code = match limitbox::cli::run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}
