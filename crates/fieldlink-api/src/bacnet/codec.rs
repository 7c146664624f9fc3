// ── BACnet/IP wire codec ──
//
// Encodes ReadPropertyMultiple confirmed requests inside a BVLC
// Original-Unicast frame, and decodes the replies a device can send
// back: Complex-ACK, Error, Reject and Abort PDUs.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    ApplicationValue, ObjectId, PropertyError, PropertyId, PropertyResult, ReadAccessResult,
    ReadAccessSpec,
};
use crate::error::Error;

const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
const BVLC_FORWARDED: u8 = 0x04;
const NPDU_VERSION: u8 = 0x01;
const NPDU_EXPECTING_REPLY: u8 = 0x04;

const PDU_CONFIRMED_REQUEST: u8 = 0x0;
const PDU_SIMPLE_ACK: u8 = 0x2;
const PDU_COMPLEX_ACK: u8 = 0x3;
const PDU_ERROR: u8 = 0x5;
const PDU_REJECT: u8 = 0x6;
const PDU_ABORT: u8 = 0x7;

const SERVICE_READ_PROPERTY_MULTIPLE: u8 = 14;

/// Max segments: unspecified; max APDU accepted: 1476 octets.
const MAX_APDU_1476: u8 = 0x05;

/// Largest unsegmented APDU this client sends or accepts.
pub const MAX_APDU_LEN: usize = 1476;

/// Reply octets budgeted for one property value. Covers a 32-character
/// name with room to spare; longer values may still overflow.
pub const REPLY_PROPERTY_BUDGET: usize = 48;

const REQUEST_HEADER_LEN: usize = 4;
const ACK_HEADER_LEN: usize = 3;

// ── Decoded frames ──────────────────────────────────────────────────

/// The APDU carried by a reply frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ReadPropertyMultipleAck(Vec<ReadAccessResult>),
    Error { class: u32, code: u32 },
    Reject { reason: u8 },
    Abort { reason: u8 },
    SimpleAck,
}

/// A reply frame routed by its invoke id.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub invoke_id: u8,
    pub apdu: Apdu,
}

// ── Encoding ────────────────────────────────────────────────────────

/// Encode a complete BVLC/NPDU/APDU ReadPropertyMultiple request.
pub fn encode_read_property_multiple(invoke_id: u8, specs: &[ReadAccessSpec]) -> Bytes {
    let mut apdu = BytesMut::with_capacity(16 + specs.len() * 8);
    apdu.put_u8(PDU_CONFIRMED_REQUEST << 4);
    apdu.put_u8(MAX_APDU_1476);
    apdu.put_u8(invoke_id);
    apdu.put_u8(SERVICE_READ_PROPERTY_MULTIPLE);

    for spec in specs {
        put_read_access_spec(&mut apdu, spec);
    }

    let npdu_len = 2;
    let total = 4 + npdu_len + apdu.len();
    let mut frame = BytesMut::with_capacity(total);
    frame.put_u8(BVLC_TYPE);
    frame.put_u8(BVLC_ORIGINAL_UNICAST);
    frame.put_u16(u16::try_from(total).unwrap_or(u16::MAX));
    frame.put_u8(NPDU_VERSION);
    frame.put_u8(NPDU_EXPECTING_REPLY);
    frame.extend_from_slice(&apdu);
    frame.freeze()
}

fn put_read_access_spec(buf: &mut BytesMut, spec: &ReadAccessSpec) {
    put_context_object_id(buf, 0, spec.object);
    put_opening_tag(buf, 1);
    for property in &spec.properties {
        put_context_unsigned(buf, 0, property.code());
    }
    put_closing_tag(buf, 1);
}

fn request_len(spec: &ReadAccessSpec) -> usize {
    let mut buf = BytesMut::new();
    put_read_access_spec(&mut buf, spec);
    buf.len()
}

/// Upper estimate of a spec's share of the Complex-ACK: object id and
/// list tags, then per property its id, list tags and a value budget.
fn reply_len(spec: &ReadAccessSpec) -> usize {
    7 + spec.properties.len() * (4 + 2 + REPLY_PROPERTY_BUDGET)
}

/// Split `specs` into consecutive groups whose request APDU fits in
/// `max_apdu` and whose expected reply does too, so no group needs
/// segmentation. A spec too large on its own still gets its own group.
pub fn split_read_access(specs: &[ReadAccessSpec], max_apdu: usize) -> Vec<Vec<ReadAccessSpec>> {
    let request_room = max_apdu.saturating_sub(REQUEST_HEADER_LEN);
    let reply_room = max_apdu.saturating_sub(ACK_HEADER_LEN);

    let mut groups = Vec::new();
    let mut current: Vec<ReadAccessSpec> = Vec::new();
    let (mut request, mut reply) = (0, 0);
    for spec in specs {
        let (req, rep) = (request_len(spec), reply_len(spec));
        if !current.is_empty() && (request + req > request_room || reply + rep > reply_room) {
            groups.push(std::mem::take(&mut current));
            (request, reply) = (0, 0);
        }
        request += req;
        reply += rep;
        current.push(spec.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn put_tag(buf: &mut BytesMut, number: u8, context: bool, len: usize) {
    let class = if context { 0x08 } else { 0x00 };
    let number_bits = if number < 15 { number << 4 } else { 0xF0 };
    if len < 5 {
        buf.put_u8(number_bits | class | u8::try_from(len).unwrap_or(0));
    } else {
        buf.put_u8(number_bits | class | 5);
    }
    if number >= 15 {
        buf.put_u8(number);
    }
    if len >= 5 {
        match u8::try_from(len) {
            Ok(short) if short < 254 => buf.put_u8(short),
            _ => match u16::try_from(len) {
                Ok(medium) => {
                    buf.put_u8(254);
                    buf.put_u16(medium);
                }
                Err(_) => {
                    buf.put_u8(255);
                    buf.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
                }
            },
        }
    }
}

fn put_context_unsigned(buf: &mut BytesMut, number: u8, value: u32) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    let significant = bytes.get(skip..).unwrap_or(&bytes);
    put_tag(buf, number, true, significant.len());
    buf.extend_from_slice(significant);
}

fn put_context_object_id(buf: &mut BytesMut, number: u8, object: ObjectId) {
    put_tag(buf, number, true, 4);
    buf.put_u32(object.to_wire());
}

fn put_opening_tag(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0E);
}

fn put_closing_tag(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0F);
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode a reply frame received from a device.
pub fn decode_frame(frame: &[u8]) -> Result<Frame, Error> {
    let mut r = Reader::new(frame);

    if r.u8()? != BVLC_TYPE {
        return Err(Error::decode("not a BACnet/IP frame"));
    }
    let function = r.u8()?;
    let declared = usize::from(r.u16()?);
    if declared != frame.len() {
        return Err(Error::decode(format!(
            "BVLC length {declared} does not match frame length {}",
            frame.len()
        )));
    }
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => {}
        BVLC_FORWARDED => r.skip(6)?,
        other => return Err(Error::decode(format!("unsupported BVLC function {other:#04x}"))),
    }

    skip_npdu(&mut r)?;
    decode_apdu(&mut r)
}

fn skip_npdu(r: &mut Reader<'_>) -> Result<(), Error> {
    if r.u8()? != NPDU_VERSION {
        return Err(Error::decode("unsupported NPDU version"));
    }
    let control = r.u8()?;
    if control & 0x80 != 0 {
        return Err(Error::decode("network layer message"));
    }
    let has_destination = control & 0x20 != 0;
    if has_destination {
        r.skip(2)?;
        let len = usize::from(r.u8()?);
        r.skip(len)?;
    }
    if control & 0x08 != 0 {
        r.skip(2)?;
        let len = usize::from(r.u8()?);
        r.skip(len)?;
    }
    if has_destination {
        r.skip(1)?;
    }
    Ok(())
}

fn decode_apdu(r: &mut Reader<'_>) -> Result<Frame, Error> {
    let header = r.u8()?;
    match header >> 4 {
        PDU_COMPLEX_ACK => {
            if header & 0x08 != 0 {
                return Err(Error::decode("segmented responses are not supported"));
            }
            let invoke_id = r.u8()?;
            let service = r.u8()?;
            if service != SERVICE_READ_PROPERTY_MULTIPLE {
                return Err(Error::decode(format!("unexpected service choice {service}")));
            }
            let results = decode_read_access_results(r)?;
            Ok(Frame {
                invoke_id,
                apdu: Apdu::ReadPropertyMultipleAck(results),
            })
        }
        PDU_SIMPLE_ACK => {
            let invoke_id = r.u8()?;
            Ok(Frame {
                invoke_id,
                apdu: Apdu::SimpleAck,
            })
        }
        PDU_ERROR => {
            let invoke_id = r.u8()?;
            let _service = r.u8()?;
            let class = expect_application_enumerated(r)?;
            let code = expect_application_enumerated(r)?;
            Ok(Frame {
                invoke_id,
                apdu: Apdu::Error { class, code },
            })
        }
        PDU_REJECT => {
            let invoke_id = r.u8()?;
            let reason = r.u8()?;
            Ok(Frame {
                invoke_id,
                apdu: Apdu::Reject { reason },
            })
        }
        PDU_ABORT => {
            let invoke_id = r.u8()?;
            let reason = r.u8()?;
            Ok(Frame {
                invoke_id,
                apdu: Apdu::Abort { reason },
            })
        }
        other => Err(Error::decode(format!("unexpected PDU type {other}"))),
    }
}

fn decode_read_access_results(r: &mut Reader<'_>) -> Result<Vec<ReadAccessResult>, Error> {
    let mut results = Vec::new();
    while !r.is_empty() {
        let tag = r.tag()?;
        if !tag.is_context(0) {
            return Err(Error::decode("expected object identifier"));
        }
        let raw = r.unsigned(tag.len)?;
        let raw = u32::try_from(raw).map_err(|_| Error::decode("object identifier overflow"))?;
        let object =
            ObjectId::from_wire(raw).ok_or_else(|| Error::decode("unsupported object type"))?;

        if !r.tag()?.is_opening(1) {
            return Err(Error::decode("expected list of results"));
        }

        let mut properties = Vec::new();
        loop {
            let tag = r.tag()?;
            if tag.is_closing(1) {
                break;
            }
            if !tag.is_context(2) {
                return Err(Error::decode("expected property identifier"));
            }
            let property_code = r.unsigned(tag.len)?;

            let mut next = r.tag()?;
            let mut array_index = None;
            if next.is_context(3) {
                array_index = u32::try_from(r.unsigned(next.len)?).ok();
                next = r.tag()?;
            }

            let value = if next.is_opening(4) {
                let mut values = Vec::new();
                loop {
                    let inner = r.tag()?;
                    if inner.is_closing(4) {
                        break;
                    }
                    values.push(decode_application_value(r, inner)?);
                }
                Ok(values)
            } else if next.is_opening(5) {
                let class = expect_application_enumerated(r)?;
                let code = expect_application_enumerated(r)?;
                if !r.tag()?.is_closing(5) {
                    return Err(Error::decode("unterminated property access error"));
                }
                Err(PropertyError { class, code })
            } else {
                return Err(Error::decode("expected property value or error"));
            };

            let property = u32::try_from(property_code)
                .ok()
                .and_then(PropertyId::from_repr);
            match property {
                Some(property) => properties.push(PropertyResult {
                    property,
                    array_index,
                    value,
                }),
                None => tracing::trace!(property = property_code, "skipping unrequested property"),
            }
        }

        results.push(ReadAccessResult {
            object,
            results: properties,
        });
    }
    Ok(results)
}

fn expect_application_enumerated(r: &mut Reader<'_>) -> Result<u32, Error> {
    let tag = r.tag()?;
    if tag.context || tag.number != 9 {
        return Err(Error::decode("expected enumerated value"));
    }
    u32::try_from(r.unsigned(tag.len)?).map_err(|_| Error::decode("enumerated overflow"))
}

fn decode_application_value(r: &mut Reader<'_>, tag: Tag) -> Result<ApplicationValue, Error> {
    if tag.context {
        return Err(Error::decode("context-tagged values are not supported"));
    }
    let value = match tag.number {
        0 => ApplicationValue::Null,
        1 => ApplicationValue::Boolean(tag.len != 0),
        2 => ApplicationValue::Unsigned(r.unsigned(tag.len)?),
        3 => ApplicationValue::Signed(r.signed(tag.len)?),
        4 => {
            let bytes = r.array::<4>()?;
            ApplicationValue::Real(f32::from_be_bytes(bytes))
        }
        5 => {
            let bytes = r.array::<8>()?;
            ApplicationValue::Double(f64::from_be_bytes(bytes))
        }
        6 => ApplicationValue::OctetString(r.take(tag.len)?.to_vec()),
        7 => {
            let bytes = r.take(tag.len)?;
            let (charset, text) = bytes
                .split_first()
                .ok_or_else(|| Error::decode("empty character string"))?;
            ApplicationValue::CharacterString(decode_charset(*charset, text))
        }
        8 => {
            let bytes = r.take(tag.len)?;
            let (unused, rest) = bytes
                .split_first()
                .ok_or_else(|| Error::decode("empty bit string"))?;
            ApplicationValue::BitString {
                unused_bits: *unused,
                bytes: rest.to_vec(),
            }
        }
        9 => ApplicationValue::Enumerated(
            u32::try_from(r.unsigned(tag.len)?).map_err(|_| Error::decode("enumerated overflow"))?,
        ),
        10 => {
            let [year, month, day, weekday] = r.array::<4>()?;
            ApplicationValue::Date {
                year: 1900 + u16::from(year),
                month,
                day,
                weekday,
            }
        }
        11 => {
            let [hour, minute, second, hundredths] = r.array::<4>()?;
            ApplicationValue::Time {
                hour,
                minute,
                second,
                hundredths,
            }
        }
        12 => {
            let raw = u32::from_be_bytes(r.array::<4>()?);
            ApplicationValue::ObjectId {
                object_type: u16::try_from(raw >> 22).unwrap_or(u16::MAX),
                instance: raw & super::MAX_INSTANCE,
            }
        }
        other => return Err(Error::decode(format!("unknown application tag {other}"))),
    };
    Ok(value)
}

fn decode_charset(charset: u8, text: &[u8]) -> String {
    match charset {
        // UCS-2, big endian
        4 => {
            let units: Vec<u16> = text
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        // ISO 8859-1
        5 => text.iter().map(|b| char::from(*b)).collect(),
        _ => String::from_utf8_lossy(text).into_owned(),
    }
}

// ── Reader ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Tag {
    number: u8,
    context: bool,
    opening: bool,
    closing: bool,
    len: usize,
}

impl Tag {
    fn is_context(self, number: u8) -> bool {
        self.context && !self.opening && !self.closing && self.number == number
    }

    fn is_opening(self, number: u8) -> bool {
        self.opening && self.number == number
    }

    fn is_closing(self, number: u8) -> bool {
        self.closing && self.number == number
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::decode("truncated frame"))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::decode("truncated frame"))?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.take(N)?;
        <[u8; N]>::try_from(slice).map_err(|_| Error::decode("truncated frame"))
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn unsigned(&mut self, len: usize) -> Result<u64, Error> {
        if len == 0 || len > 8 {
            return Err(Error::decode(format!("invalid unsigned length {len}")));
        }
        Ok(self
            .take(len)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn signed(&mut self, len: usize) -> Result<i64, Error> {
        if len == 0 || len > 8 {
            return Err(Error::decode(format!("invalid signed length {len}")));
        }
        let bytes = self.take(len)?;
        let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
        let mut full = [fill; 8];
        full[8 - len..].copy_from_slice(bytes);
        Ok(i64::from_be_bytes(full))
    }

    fn tag(&mut self) -> Result<Tag, Error> {
        let first = self.u8()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;

        if context && lvt == 6 {
            return Ok(Tag {
                number,
                context,
                opening: true,
                closing: false,
                len: 0,
            });
        }
        if context && lvt == 7 {
            return Ok(Tag {
                number,
                context,
                opening: false,
                closing: true,
                len: 0,
            });
        }

        let len = if lvt == 5 {
            match self.u8()? {
                254 => usize::from(self.u16()?),
                255 => usize::try_from(u32::from_be_bytes(self.array::<4>()?))
                    .map_err(|_| Error::decode("tag length overflow"))?,
                short => usize::from(short),
            }
        } else {
            usize::from(lvt)
        };

        Ok(Tag {
            number,
            context,
            opening: false,
            closing: false,
            len,
        })
    }
}

// ── Test frame builders ─────────────────────────────────────────────

/// Builders for device-side reply frames, used by tests and simulators.
pub mod reply {
    use bytes::{BufMut, BytesMut};

    use super::{
        BVLC_ORIGINAL_UNICAST, BVLC_TYPE, NPDU_VERSION, PDU_ABORT, PDU_COMPLEX_ACK, PDU_ERROR,
        SERVICE_READ_PROPERTY_MULTIPLE, put_closing_tag, put_context_object_id,
        put_context_unsigned, put_opening_tag, put_tag,
    };
    use crate::bacnet::{ApplicationValue, ReadAccessResult};

    /// Encode a Complex-ACK for ReadPropertyMultiple.
    pub fn read_property_multiple_ack(invoke_id: u8, results: &[ReadAccessResult]) -> Vec<u8> {
        let mut apdu = BytesMut::new();
        apdu.put_u8(PDU_COMPLEX_ACK << 4);
        apdu.put_u8(invoke_id);
        apdu.put_u8(SERVICE_READ_PROPERTY_MULTIPLE);
        for result in results {
            put_context_object_id(&mut apdu, 0, result.object);
            put_opening_tag(&mut apdu, 1);
            for property in &result.results {
                put_context_unsigned(&mut apdu, 2, property.property.code());
                if let Some(index) = property.array_index {
                    put_context_unsigned(&mut apdu, 3, index);
                }
                match &property.value {
                    Ok(values) => {
                        put_opening_tag(&mut apdu, 4);
                        for value in values {
                            put_application_value(&mut apdu, value);
                        }
                        put_closing_tag(&mut apdu, 4);
                    }
                    Err(error) => {
                        put_opening_tag(&mut apdu, 5);
                        put_enumerated(&mut apdu, error.class);
                        put_enumerated(&mut apdu, error.code);
                        put_closing_tag(&mut apdu, 5);
                    }
                }
            }
            put_closing_tag(&mut apdu, 1);
        }
        wrap(&apdu)
    }

    /// Encode an Error-PDU.
    pub fn error(invoke_id: u8, class: u32, code: u32) -> Vec<u8> {
        let mut apdu = BytesMut::new();
        apdu.put_u8(PDU_ERROR << 4);
        apdu.put_u8(invoke_id);
        apdu.put_u8(SERVICE_READ_PROPERTY_MULTIPLE);
        put_enumerated(&mut apdu, class);
        put_enumerated(&mut apdu, code);
        wrap(&apdu)
    }

    /// Encode an Abort-PDU sent by the server.
    pub fn abort(invoke_id: u8, reason: u8) -> Vec<u8> {
        wrap(&[(PDU_ABORT << 4) | 0x01, invoke_id, reason])
    }

    fn put_enumerated(buf: &mut BytesMut, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
        let significant = bytes.get(skip..).unwrap_or(&bytes);
        put_tag(buf, 9, false, significant.len());
        buf.extend_from_slice(significant);
    }

    fn put_application_value(buf: &mut BytesMut, value: &ApplicationValue) {
        match value {
            ApplicationValue::Null => buf.put_u8(0x00),
            ApplicationValue::Boolean(b) => buf.put_u8(0x10 | u8::from(*b)),
            ApplicationValue::Unsigned(u) => {
                let bytes = u.to_be_bytes();
                let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
                let significant = bytes.get(skip..).unwrap_or(&bytes);
                put_tag(buf, 2, false, significant.len());
                buf.extend_from_slice(significant);
            }
            ApplicationValue::Signed(i) => {
                put_tag(buf, 3, false, 8);
                buf.put_i64(*i);
            }
            ApplicationValue::Real(r) => {
                put_tag(buf, 4, false, 4);
                buf.put_f32(*r);
            }
            ApplicationValue::Double(d) => {
                put_tag(buf, 5, false, 8);
                buf.put_f64(*d);
            }
            ApplicationValue::OctetString(bytes) => {
                put_tag(buf, 6, false, bytes.len());
                buf.extend_from_slice(bytes);
            }
            ApplicationValue::CharacterString(s) => {
                put_tag(buf, 7, false, s.len() + 1);
                buf.put_u8(0);
                buf.extend_from_slice(s.as_bytes());
            }
            ApplicationValue::BitString { unused_bits, bytes } => {
                put_tag(buf, 8, false, bytes.len() + 1);
                buf.put_u8(*unused_bits);
                buf.extend_from_slice(bytes);
            }
            ApplicationValue::Enumerated(e) => put_enumerated(buf, *e),
            ApplicationValue::Date {
                year,
                month,
                day,
                weekday,
            } => {
                put_tag(buf, 10, false, 4);
                buf.put_u8(u8::try_from(year.saturating_sub(1900)).unwrap_or(u8::MAX));
                buf.put_u8(*month);
                buf.put_u8(*day);
                buf.put_u8(*weekday);
            }
            ApplicationValue::Time {
                hour,
                minute,
                second,
                hundredths,
            } => {
                put_tag(buf, 11, false, 4);
                buf.put_u8(*hour);
                buf.put_u8(*minute);
                buf.put_u8(*second);
                buf.put_u8(*hundredths);
            }
            ApplicationValue::ObjectId {
                object_type,
                instance,
            } => {
                put_tag(buf, 12, false, 4);
                buf.put_u32((u32::from(*object_type) << 22) | instance);
            }
        }
    }

    fn wrap(apdu: &[u8]) -> Vec<u8> {
        let total = 4 + 2 + apdu.len();
        let mut frame = Vec::with_capacity(total);
        frame.push(BVLC_TYPE);
        frame.push(BVLC_ORIGINAL_UNICAST);
        frame.extend_from_slice(&u16::try_from(total).unwrap_or(u16::MAX).to_be_bytes());
        frame.push(NPDU_VERSION);
        frame.push(0x00);
        frame.extend_from_slice(apdu);
        frame
    }
}

/// Extract the invoke id and specs from an encoded request. Used by
/// device simulators to answer what was asked.
pub fn decode_request(frame: &[u8]) -> Result<(u8, Vec<ReadAccessSpec>), Error> {
    let mut r = Reader::new(frame);
    if r.u8()? != BVLC_TYPE {
        return Err(Error::decode("not a BACnet/IP frame"));
    }
    r.skip(3)?;
    skip_npdu(&mut r)?;
    if r.u8()? >> 4 != PDU_CONFIRMED_REQUEST {
        return Err(Error::decode("not a confirmed request"));
    }
    r.skip(1)?;
    let invoke_id = r.u8()?;
    if r.u8()? != SERVICE_READ_PROPERTY_MULTIPLE {
        return Err(Error::decode("not a ReadPropertyMultiple request"));
    }

    let mut specs = Vec::new();
    while !r.is_empty() {
        let tag = r.tag()?;
        if !tag.is_context(0) {
            return Err(Error::decode("expected object identifier"));
        }
        let raw = u32::try_from(r.unsigned(tag.len)?)
            .map_err(|_| Error::decode("object identifier overflow"))?;
        let object =
            ObjectId::from_wire(raw).ok_or_else(|| Error::decode("unsupported object type"))?;
        if !r.tag()?.is_opening(1) {
            return Err(Error::decode("expected property references"));
        }
        let mut properties = Vec::new();
        loop {
            let tag = r.tag()?;
            if tag.is_closing(1) {
                break;
            }
            let code = u32::try_from(r.unsigned(tag.len)?)
                .map_err(|_| Error::decode("property identifier overflow"))?;
            if let Some(property) = PropertyId::from_repr(code) {
                properties.push(property);
            }
        }
        specs.push(ReadAccessSpec { object, properties });
    }
    Ok((invoke_id, specs))
}
