//! OSC codec: typed arguments, messages, bundles, and the binary encode/decode
//! that rides on `rosc` (spec §4.1).
//!
//! `rosc` already implements the OSC-1.0 binary framing (4-byte-aligned
//! strings, the `,`-prefixed type-tag string, `#bundle\0` framing, 32-bit
//! big-endian element-size prefixes) exactly as spec'd, so the codec here
//! is a thin, crate-owned tagged union (`OscArg`) around `rosc::OscType`
//! plus the argument-count/size checks spec.md calls out — the same shape
//! as the teacher's `backend::RawArg` / `raw_to_osc` conversion in
//! `imbolc-audio::engine::backend`, generalized from SuperCollider-specific
//! call sites into a general-purpose codec.

pub mod timetag;

pub use timetag::OscTimeTag;

use crate::error::{OscError, Result};

/// A single OSC argument. Preserves declared order within a message.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int32(i32),
    Float64(f64),
    Str(String),
    Blob(Vec<u8>),
    Time(OscTimeTag),
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        OscArg::Int32(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        OscArg::Float64(v as f64)
    }
}

impl From<f64> for OscArg {
    fn from(v: f64) -> Self {
        OscArg::Float64(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        OscArg::Str(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        OscArg::Str(v)
    }
}

impl From<Vec<u8>> for OscArg {
    fn from(v: Vec<u8>) -> Self {
        OscArg::Blob(v)
    }
}

impl From<OscTimeTag> for OscArg {
    fn from(v: OscTimeTag) -> Self {
        OscArg::Time(v)
    }
}

/// Max length representable in OSC's 32-bit length-prefixed strings/blobs.
const MAX_ARG_LEN: usize = u32::MAX as usize;

fn arg_to_rosc(arg: &OscArg) -> Result<rosc::OscType> {
    Ok(match arg {
        OscArg::Int32(v) => rosc::OscType::Int(*v),
        OscArg::Float64(v) => rosc::OscType::Double(*v),
        OscArg::Str(s) => {
            if s.len() > MAX_ARG_LEN {
                return Err(OscError::ArgumentTooLarge);
            }
            rosc::OscType::String(s.clone())
        }
        OscArg::Blob(b) => {
            if b.len() > MAX_ARG_LEN {
                return Err(OscError::ArgumentTooLarge);
            }
            rosc::OscType::Blob(b.clone())
        }
        OscArg::Time(t) => rosc::OscType::Time(t.to_rosc()),
    })
}

fn arg_from_rosc(t: rosc::OscType) -> Result<OscArg> {
    use rosc::OscType as R;
    Ok(match t {
        R::Int(v) => OscArg::Int32(v),
        R::Long(v) => OscArg::Int32(v as i32),
        R::Float(v) => OscArg::Float64(v as f64),
        R::Double(v) => OscArg::Float64(v),
        R::String(s) => OscArg::Str(s),
        R::Blob(b) => OscArg::Blob(b),
        R::Time(t) => OscArg::Time(OscTimeTag::from_rosc(t)),
        other => {
            return Err(OscError::MalformedPacket(format!(
                "unsupported argument type {other:?}"
            )))
        }
    })
}

/// An immutable OSC message: an address pattern plus ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub addr: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(addr: impl Into<String>, args: Vec<OscArg>) -> Self {
        OscMessage {
            addr: addr.into(),
            args,
        }
    }

    fn to_rosc(&self) -> Result<rosc::OscMessage> {
        let args = self
            .args
            .iter()
            .map(arg_to_rosc)
            .collect::<Result<Vec<_>>>()?;
        Ok(rosc::OscMessage {
            addr: self.addr.clone(),
            args,
        })
    }

    fn from_rosc(m: rosc::OscMessage) -> Result<Self> {
        let args = m
            .args
            .into_iter()
            .map(arg_from_rosc)
            .collect::<Result<Vec<_>>>()?;
        Ok(OscMessage { addr: m.addr, args })
    }
}

/// One element of a bundle: either a plain message or a nested bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum OscElement {
    Message(OscMessage),
    Bundle(OscBundle),
}

/// An OSC bundle: an absolute timetag plus an ordered sequence of elements.
#[derive(Debug, Clone, PartialEq)]
pub struct OscBundle {
    pub timetag: OscTimeTag,
    pub elements: Vec<OscElement>,
}

/// The top-level unit exchanged over the wire: a message or a bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum OscPacket {
    Message(OscMessage),
    Bundle(OscBundle),
}

impl OscPacket {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let rosc_packet = to_rosc_packet(self)?;
        rosc::encoder::encode(&rosc_packet)
            .map_err(|e| OscError::MalformedPacket(format!("{e:?}")))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (_, packet) = rosc::decoder::decode_udp(buf)
            .map_err(|e| OscError::MalformedPacket(format!("{e:?}")))?;
        from_rosc_packet(packet)
    }
}

fn to_rosc_packet(packet: &OscPacket) -> Result<rosc::OscPacket> {
    Ok(match packet {
        OscPacket::Message(m) => rosc::OscPacket::Message(m.to_rosc()?),
        OscPacket::Bundle(b) => rosc::OscPacket::Bundle(to_rosc_bundle(b)?),
    })
}

fn to_rosc_bundle(bundle: &OscBundle) -> Result<rosc::OscBundle> {
    let content = bundle
        .elements
        .iter()
        .map(|el| match el {
            OscElement::Message(m) => Ok(rosc::OscPacket::Message(m.to_rosc()?)),
            OscElement::Bundle(b) => Ok(rosc::OscPacket::Bundle(to_rosc_bundle(b)?)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rosc::OscBundle {
        timetag: bundle.timetag.to_rosc(),
        content,
    })
}

fn from_rosc_packet(packet: rosc::OscPacket) -> Result<OscPacket> {
    Ok(match packet {
        rosc::OscPacket::Message(m) => OscPacket::Message(OscMessage::from_rosc(m)?),
        rosc::OscPacket::Bundle(b) => OscPacket::Bundle(from_rosc_bundle(b)?),
    })
}

fn from_rosc_bundle(bundle: rosc::OscBundle) -> Result<OscBundle> {
    let elements = bundle
        .content
        .into_iter()
        .map(|p| match p {
            rosc::OscPacket::Message(m) => Ok(OscElement::Message(OscMessage::from_rosc(m)?)),
            rosc::OscPacket::Bundle(b) => Ok(OscElement::Bundle(from_rosc_bundle(b)?)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(OscBundle {
        timetag: OscTimeTag::from_rosc(bundle.timetag),
        elements,
    })
}
