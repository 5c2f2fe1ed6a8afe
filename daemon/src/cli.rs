use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Opts {
    /// The `HOST:PORT` this daemon listens on. Also handed to delivered
    /// peers so they can call back.
    #[clap(long, default_value = "127.0.0.1:7000")]
    pub listen_address: String,

    /// Script spawned to (re)deliver a dead peer. Receives the peer host
    /// and our own address as arguments.
    #[clap(long, default_value = "./deliver.sh")]
    pub deliver_script: PathBuf,

    /// If enabled logs will be in JSON format.
    #[clap(short, long)]
    pub json: bool,

    /// Host names of every peer in the fleet.
    #[clap(required = true)]
    pub peers: Vec<String>,
}
