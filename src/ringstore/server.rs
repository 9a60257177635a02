use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;

use ringstore_dht::operator::DhtOperator;
use ringstore_dht::proto::{DhtRpc, ReplyBody};
use ringstore_dht::tasks::{CheckTableWorker, MonitorWorker};
use ringstore_rpc::{run_rpc_server, Request, Role, RpcAnswer, RpcClient};
use ringstore_util::background::BackgroundRunner;
use ringstore_util::config::read_config;
use ringstore_util::error::Error;

pub async fn run_server(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Initializing DHT operator...");
	let operator = DhtOperator::new(config.clone())?;

	let watch_cancel = watch_shutdown_signal();

	info!("Initializing background runner...");
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());
	background.spawn_worker(CheckTableWorker::new(operator.clone()));
	background.spawn_worker(MonitorWorker::new(operator.clone()));

	info!("Launching RPC server...");
	let rpc_server = tokio::spawn(run_rpc_server::<DhtRpc, _>(
		config.rpc_bind_addr,
		operator.clone(),
		watch_cancel.clone(),
	));

	info!("Joining the ring...");
	operator.bootstrap().await;

	// Stuff runs, until a cancel signal is sent
	let mut cancel = watch_cancel.clone();
	while !*cancel.borrow() {
		if cancel.changed().await.is_err() {
			break;
		}
	}

	info!("Leaving the ring...");
	operator.stop_inherited().await;

	if let Err(e) = rpc_server.await? {
		error!("RPC server exited with error: {}", e);
	}

	// Await for all background tasks to end
	await_background_done.await?;

	info!("Cleaning up...");
	Ok(())
}

pub async fn print_status(config_file: PathBuf) -> Result<(), Error> {
	let config = read_config(config_file)?;
	let rpc = RpcClient::new(Duration::from_secs(config.rpc_timeout));

	let req = Request::new(
		"0.0.0.0:0".parse().unwrap(),
		Role::Monitor,
		DhtRpc::NodeStatistic,
	);
	let answer: RpcAnswer<ReplyBody> = rpc.call(config.rpc_public_addr(), req, None).await?;
	match answer.resp.body {
		ReplyBody::DhtInfo(info) => {
			println!("Status:        {}", info.status);
			println!("Range:         {} - {}", info.range_start, info.range_end);
			println!("Master data:   {}", bytesize::ByteSize::b(info.range_size));
			println!("Replica data:  {}", bytesize::ByteSize::b(info.replicas_size));
			println!("Metadata:      {}", bytesize::ByteSize::b(info.metadata_size));
			println!(
				"Free space:    {} ({:.1}%)",
				bytesize::ByteSize::b(info.free_size),
				info.free_size_percents
			);
			Ok(())
		}
		_ => Err(Error::Message(format!(
			"Unexpected NodeStatistic reply: [{}] {}",
			answer.resp.code, answer.resp.message
		))),
	}
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(windows)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::windows::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = ctrl_c().expect("Failed to install Ctrl-C handler");
		let mut sigclose = ctrl_close().expect("Failed to install Ctrl-Close handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received Ctrl-C, shutting down."),
			_ = sigclose.recv() => info!("Received Ctrl-Close, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
