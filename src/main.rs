use armour::cli::{Cli, Command};
use armour::logging::{self, LogFormat};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Human };
    logging::init(&cli.log_level, format);

    let exit_code = match cli.command {
        Command::Serve(cmd) => cmd.execute().await,
        Command::Registry(cmd) => cmd.execute(),
        Command::Inspect(cmd) => cmd.execute().await,
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("armour: {e}");
            std::process::exit(config_exit_code(&e));
        }
    }
}

fn config_exit_code(err: &armour::error::ProxyError) -> i32 {
    use armour::error::ProxyError;
    match err {
        ProxyError::ConfigInvalid(_) => 2,
        ProxyError::RegistryNotFound(_) => 3,
        _ => 1,
    }
}
