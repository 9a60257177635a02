//! Ringstore node CLI

#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "ringstore")]
struct Opt {
	/// Configuration file location
	#[structopt(short, long, default_value = "/etc/ringstore.toml")]
	config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run the storage node
	#[structopt(name = "server")]
	Server,
	/// Print the DHT statistics of a running node
	#[structopt(name = "status")]
	Status,
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "ringstore=info")
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let opt = Opt::from_args();

	let res = match opt.cmd {
		Command::Server => server::run_server(opt.config_file).await,
		Command::Status => server::print_status(opt.config_file).await,
	};
	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}
