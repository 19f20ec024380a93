use clap::Parser;

use kronk_daemon::{cli, logging, paths};

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    // The detached daemon logs to the project file; everything else to
    // stderr.
    let as_daemon = std::env::var("KRONK_DAEMON").as_deref() == Ok("1");
    if as_daemon {
        let project = paths::resolve_project_root(
            &std::env::current_dir().unwrap_or_else(|_| ".".into()),
        );
        if logging::init_file(&project.log(), args.debug).is_err() {
            logging::init_stderr(args.debug);
        }
    } else {
        logging::init_stderr(args.debug);
    }

    if let Err(e) = cli::execute(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
