use clap::Parser;

#[derive(Parser)]
pub struct Opts {
    /// Host name this peer is known by in the fleet; peers address us as
    /// `<host>:<port>` with the port picked at start time.
    #[clap(long)]
    pub host: String,

    /// Address (`HOST:PORT`) of the control daemon.
    #[clap(long)]
    pub daemon: String,

    /// If enabled logs will be in JSON format.
    #[clap(short, long)]
    pub json: bool,
}
