use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use spinelhost::mainloop::deadline_after;
use spinelhost::transport::{SpinelInterface, TransportError, TransportFactory};

use crate::cmd::{collect_frames, parse_url, Received, SendArgs};
use crate::exit::{transport_error, CliError, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = parse_hex(&args.hex)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let url = parse_url(&args.url)?;

    let (callback, received) = collect_frames();
    let mut radio = TransportFactory::new()
        .open(&url, callback)
        .map_err(|err| transport_error("open failed", err))?;

    let result = exchange(radio.as_mut(), &payload, args.wait.then_some(wait_timeout), &received);
    let interface = radio.interface_type();
    radio.deinit();

    if let Some(frame) = result? {
        print_frame(&frame, interface, format);
    }
    Ok(SUCCESS)
}

fn exchange(
    radio: &mut dyn SpinelInterface,
    payload: &[u8],
    wait: Option<Duration>,
    received: &Received,
) -> CliResult<Option<Vec<u8>>> {
    radio
        .send_frame(payload)
        .map_err(|err| transport_error("send failed", err))?;

    match wait {
        Some(timeout) => wait_for_response(radio, received, timeout)
            .map(Some)
            .map_err(|err| transport_error("receive failed", err)),
        None => Ok(None),
    }
}

/// Pump the transport until a frame is delivered or `timeout` runs out.
fn wait_for_response(
    radio: &mut dyn SpinelInterface,
    received: &Received,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let deadline = deadline_after(timeout);
    loop {
        if let Some(frame) = received.borrow_mut().pop_front() {
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::ResponseTimeout);
        }
        radio.wait_for_frame(remaining)?;
    }
}

fn parse_hex(input: &str) -> CliResult<Bytes> {
    let input = input.trim();
    let input = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();

    if digits.is_empty() {
        return Err(CliError::usage("frame must not be empty"));
    }
    if digits.len() % 2 != 0 {
        return Err(CliError::usage("hex frame has an odd number of digits"));
    }

    let mut frame = BytesMut::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let byte = std::str::from_utf8(pair)
            .ok()
            .and_then(|text| u8::from_str_radix(text, 16).ok())
            .ok_or_else(|| {
                CliError::usage(format!(
                    "invalid hex byte {:?}",
                    String::from_utf8_lossy(pair)
                ))
            })?;
        frame.put_u8(byte);
    }
    Ok(frame.freeze())
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
