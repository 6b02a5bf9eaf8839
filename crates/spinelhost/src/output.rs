use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use spinelhost::transport::spinel::{header_iid, header_tid, HEADER_FLAG};
use spinelhost::transport::{InterfaceType, RcpInterfaceMetrics};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Header fields of a spinel frame, absent when the first byte lacks the flag bit.
#[derive(Serialize, Debug, PartialEq, Eq)]
struct SpinelHeader {
    tid: u8,
    iid: u8,
    command: Option<u8>,
}

impl SpinelHeader {
    fn parse(frame: &[u8]) -> Option<Self> {
        let (&header, rest) = frame.split_first()?;
        if header & HEADER_FLAG == 0 {
            return None;
        }
        Some(Self {
            tid: header_tid(header),
            iid: header_iid(header),
            command: rest.first().copied(),
        })
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    kind: &'static str,
    interface: &'a str,
    size: usize,
    hex: String,
    header: Option<SpinelHeader>,
    timestamp: String,
}

pub fn print_frame(frame: &[u8], interface: InterfaceType, format: OutputFormat) {
    let header = SpinelHeader::parse(frame);
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                kind: "frame-received",
                interface: interface.as_str(),
                size: frame.len(),
                hex: to_hex(frame),
                header,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (tid, iid, command) = match &header {
                Some(h) => (
                    h.tid.to_string(),
                    h.iid.to_string(),
                    h.command.map(|c| c.to_string()).unwrap_or_default(),
                ),
                None => Default::default(),
            };
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["IID", "TID", "CMD", "SIZE", "FRAME"])
                .add_row(vec![iid, tid, command, frame.len().to_string(), to_hex(frame)]);
            println!("{table}");
        }
        OutputFormat::Pretty => match header {
            Some(h) => println!(
                "iid={} tid={} cmd={} size={} frame={}",
                h.iid,
                h.tid,
                h.command.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                frame.len(),
                to_hex(frame)
            ),
            None => println!("size={} frame={}", frame.len(), to_hex(frame)),
        },
        OutputFormat::Raw => print_raw(frame),
    }
}

#[derive(Serialize)]
pub struct InfoOutput<'a> {
    pub url: &'a str,
    pub scheme: &'a str,
    pub interface: &'a str,
    pub bus_speed: u32,
    pub metrics: Option<MetricsOutput>,
}

#[derive(Serialize)]
pub struct MetricsOutput {
    pub transferred_frames: u64,
    pub valid_frames: u64,
    pub garbage_frames: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
}

impl From<&RcpInterfaceMetrics> for MetricsOutput {
    fn from(m: &RcpInterfaceMetrics) -> Self {
        Self {
            transferred_frames: m.transferred_frame_count,
            valid_frames: m.transferred_valid_frame_count,
            garbage_frames: m.transferred_garbage_frame_count,
            rx_frames: m.rx_frame_count,
            rx_bytes: m.rx_frame_byte_count,
            tx_frames: m.tx_frame_count,
            tx_bytes: m.tx_frame_byte_count,
        }
    }
}

pub fn print_info(info: &InfoOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(info).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in info_rows(info) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for (field, value) in info_rows(info) {
                println!("{field}: {value}");
            }
        }
    }
}

fn info_rows(info: &InfoOutput<'_>) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("url", info.url.to_string()),
        ("scheme", info.scheme.to_string()),
        ("interface", info.interface.to_string()),
        ("bus_speed", info.bus_speed.to_string()),
    ];
    if let Some(m) = &info.metrics {
        rows.extend([
            ("transferred_frames", m.transferred_frames.to_string()),
            ("valid_frames", m.valid_frames.to_string()),
            ("garbage_frames", m.garbage_frames.to_string()),
            ("rx_frames", m.rx_frames.to_string()),
            ("rx_bytes", m.rx_bytes.to_string()),
            ("tx_frames", m.tx_frames.to_string()),
            ("tx_bytes", m.tx_bytes.to_string()),
        ]);
    }
    rows
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn to_hex(data: &[u8]) -> String {
    let mut hex = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
