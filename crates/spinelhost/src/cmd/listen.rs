use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spinelhost::mainloop::Mainloop;
use spinelhost::transport::TransportFactory;
use spinelhost::RadioSource;
use tracing::info;

use crate::cmd::{collect_frames, parse_url, ListenArgs};
use crate::exit::{transport_error, CliError, CliResult, ERRNO, FAILURE, SUCCESS};
use crate::output::{print_frame, OutputFormat};

/// Upper bound on one mainloop sleep, so Ctrl-C is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let url = parse_url(&args.url)?;
    let (callback, received) = collect_frames();
    let interface = TransportFactory::new()
        .open(&url, callback)
        .map_err(|err| transport_error("open failed", err))?;
    let kind = interface.interface_type();

    let radio = Rc::new(RefCell::new(RadioSource::new(interface)));
    let mut mainloop = Mainloop::with_timeout(POLL_INTERVAL);
    mainloop.add(&radio);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(url = %url, interface = %kind, "listening");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        mainloop
            .run_once()
            .map_err(|err| CliError::new(ERRNO, format!("mainloop failed: {err}")))?;

        let frames: Vec<Vec<u8>> = received.borrow_mut().drain(..).collect();
        for frame in frames {
            print_frame(&frame, kind, format);
            printed = printed.saturating_add(1);

            if args.count.is_some_and(|count| printed >= count) {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(FAILURE, format!("signal handler setup failed: {err}")))
}
