use spinelhost::transport::TransportFactory;

use crate::cmd::{collect_frames, parse_url, InfoArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_info, InfoOutput, MetricsOutput, OutputFormat};

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let url = parse_url(&args.url)?;
    let (callback, _received) = collect_frames();
    let mut radio = TransportFactory::new()
        .open(&url, callback)
        .map_err(|err| transport_error("open failed", err))?;

    let interface = radio.interface_type();
    let out = InfoOutput {
        url: url.as_str(),
        scheme: url.scheme(),
        interface: interface.as_str(),
        bus_speed: radio.bus_speed(),
        metrics: radio.rcp_interface_metrics().map(MetricsOutput::from),
    };
    print_info(&out, format);

    radio.deinit();
    Ok(SUCCESS)
}
