#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use labfeed_rs::{DeviceInstance, Packet, PacketType, Session};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One received packet, payload copied out of the callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Header { samplerate: u64, num_logic: i32 },
    Meta,
    Trigger,
    Logic { unitsize: u16, data: Vec<u8> },
    Analog(usize),
    End,
}

impl Seen {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Header { .. } => PacketType::Header,
            Self::Meta => PacketType::Meta,
            Self::Trigger => PacketType::Trigger,
            Self::Logic { .. } => PacketType::Logic,
            Self::Analog(_) => PacketType::Analog,
            Self::End => PacketType::End,
        }
    }
}

pub type Log = Rc<RefCell<Vec<Seen>>>;

/// Record every packet `dev` sends in `session`.
pub fn record(session: &mut Session, dev: &DeviceInstance) -> Log {
    let log: Log = Rc::default();
    let sink = Rc::clone(&log);
    let dev = dev.clone();
    session.datafeed_callback_add(move |from, packet| {
        if !from.ptr_eq(&dev) {
            return;
        }
        let seen = match packet {
            Packet::Header(h) => Seen::Header {
                samplerate: h.samplerate,
                num_logic: h.num_logic_probes,
            },
            Packet::Meta(_) => Seen::Meta,
            Packet::Trigger => Seen::Trigger,
            Packet::Logic(l) => Seen::Logic {
                unitsize: l.unitsize,
                data: l.data.to_vec(),
            },
            Packet::Analog(a) => Seen::Analog(a.data.len()),
            Packet::End => Seen::End,
        };
        sink.borrow_mut().push(seen);
    });
    log
}

/// Samples delivered across every Logic packet.
pub fn logic_samples(log: &[Seen]) -> u64 {
    log.iter()
        .map(|s| match s {
            Seen::Logic { unitsize, data } => (data.len() / usize::from(*unitsize)) as u64,
            _ => 0,
        })
        .sum()
}

/// `Header (Meta)? (Trigger? (Logic|Analog)+)* End`, with the Trigger
/// appearing at most once.
pub fn assert_stream_shape(log: &[Seen]) {
    let types: Vec<PacketType> = log.iter().map(Seen::packet_type).collect();
    assert_eq!(types.first(), Some(&PacketType::Header), "stream: {types:?}");
    assert_eq!(types.last(), Some(&PacketType::End), "stream: {types:?}");
    let count = |t: PacketType| types.iter().filter(|x| **x == t).count();
    assert_eq!(count(PacketType::Header), 1, "stream: {types:?}");
    assert_eq!(count(PacketType::End), 1, "stream: {types:?}");
    assert!(count(PacketType::Meta) <= 1, "stream: {types:?}");
    assert!(count(PacketType::Trigger) <= 1, "stream: {types:?}");

    let body = &types[1..types.len() - 1];
    let body = match body.first() {
        Some(PacketType::Meta) => &body[1..],
        _ => body,
    };
    assert!(
        !body.contains(&PacketType::Meta),
        "Meta after data: {types:?}"
    );
    if let Some(pos) = body.iter().position(|t| *t == PacketType::Trigger) {
        assert!(
            matches!(body.get(pos + 1), Some(PacketType::Logic | PacketType::Analog)),
            "Trigger not followed by data: {types:?}"
        );
    }
}
