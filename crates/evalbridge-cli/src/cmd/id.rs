//! `id`: correlation id generation and inspection.

use crate::ui::{Report, Tone};
use evalbridge_wire::id::{extract_datetime, extract_timestamp_ms};
use evalbridge_wire::MessageIdGenerator;

pub fn cmd_id_new(count: usize, tag: Option<&str>) {
    let ids = MessageIdGenerator::new();
    for _ in 0..count {
        match tag {
            Some(tag) => println!("{}", ids.generate_tagged(tag)),
            None => println!("{}", ids.generate()),
        }
    }
}

pub fn cmd_id_inspect(id: &str) -> anyhow::Result<()> {
    let Some(ms) = extract_timestamp_ms(id) else {
        anyhow::bail!("'{id}' is not a valid correlation id");
    };
    let mut report = Report::new("Correlation id");
    report
        .field("id", id)
        .field_toned("valid", "yes", Tone::Good)
        .field("timestamp", ms);
    if let Some(at) = extract_datetime(id) {
        report.field("created", at.to_rfc3339());
    }
    if let Some(tag) = id.get(37..).filter(|t| !t.is_empty()) {
        report.field("tag", tag);
    }
    report.print();
    Ok(())
}
