//! Flow worker process
//!
//! Spawned by `FlowRunner`, one process per flow invocation.

use clap::Parser;
use flowrun_sandbox::worker::{self, ReplyWriter};

#[derive(Parser, Debug)]
#[command(name = "flowrun-worker")]
#[command(about = "Executes a single flow run request read from stdin", long_about = None)]
struct Args {
    /// Verbose logging and backtraces
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let replies = ReplyWriter::stdout();
    worker::install_panic_hook(replies.clone());

    let args = Args::parse();
    if args.debug {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    worker::init_logging(args.debug);

    let code = worker::serve(replies).await;
    std::process::exit(code);
}
