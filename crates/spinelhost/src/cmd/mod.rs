use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use clap::{Args, Subcommand};
use spinelhost::frame::RxFrameBuffer;
use spinelhost::transport::{RadioUrl, ReceiveFrameCallback};

use crate::exit::{transport_error, CliResult};
use crate::output::OutputFormat;

pub mod info;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one spinel frame, optionally waiting for a reply.
    Send(SendArgs),
    /// Print frames the radio sends until interrupted.
    Listen(ListenArgs),
    /// Open a radio and report its transport.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Radio URL, e.g. spinel+hdlc+uart:///dev/ttyACM0?uart-baudrate=460800
    pub url: String,
    /// Frame bytes as hex (spaces and colons allowed).
    #[arg(long)]
    pub hex: String,
    /// Wait for one frame from the radio and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a frame when --wait is set (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Radio URL.
    pub url: String,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Radio URL.
    pub url: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build details.
    #[arg(long)]
    pub extended: bool,
}

/// Frames delivered by the transport and not yet printed.
pub type Received = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Receive callback that copies each frame out and releases the buffer.
pub fn collect_frames() -> (ReceiveFrameCallback, Received) {
    let received: Received = Rc::default();
    let sink = Rc::clone(&received);
    let callback: ReceiveFrameCallback = Box::new(move |rx: &mut RxFrameBuffer| {
        sink.borrow_mut().push_back(rx.frame().to_vec());
        rx.discard_frame();
    });
    (callback, received)
}

pub fn parse_url(raw: &str) -> CliResult<RadioUrl> {
    RadioUrl::parse(raw).map_err(|err| transport_error("bad radio url", err))
}
