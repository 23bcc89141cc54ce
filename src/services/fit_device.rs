// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Synthetic Garmin device injection for FIT uploads.
//!
//! Garmin Connect only credits training status for files recorded by a
//! device it recognizes. The rewrite strips whatever device-info records
//! a third-party file carries and appends a single record describing a
//! Forerunner 245, patching heart-rate dropouts along the way. Message
//! ordering, unknown messages and developer fields are copied byte for
//! byte; only the header sizes and CRCs are recomputed.

use std::collections::HashMap;

use crate::error::DecodeError;

/// Garmin's manufacturer id in the FIT profile.
const MANUFACTURER_GARMIN: u16 = 1;
/// Forerunner 245.
const PRODUCT_FORERUNNER_245: u16 = 3415;
/// 3.58, carried scaled by 100 on the wire.
const SOFTWARE_VERSION_X100: u16 = 358;
/// Garmin matches the serial against known device ranges; this one reads
/// as a Forerunner 245.
const SERIAL_NUMBER: u32 = 1_234_567_890;
const DEVICE_INDEX_CREATOR: u8 = 0;
const SOURCE_TYPE_LOCAL: u8 = 5;

const DEVICE_INFO_GLOBAL: u16 = 23;
const RECORD_GLOBAL: u16 = 20;
const RECORD_HR_FIELD: u8 = 3;
/// FIT's invalid sentinel for uint8 fields.
const HR_INVALID: u8 = 0xFF;

// FIT base type codes used by the synthetic definition.
const BT_ENUM: u8 = 0x00;
const BT_UINT8: u8 = 0x02;
const BT_UINT16: u8 = 0x84;
const BT_UINT32Z: u8 = 0x8C;

/// `.FIT` magic at bytes 8..12.
pub fn is_fit(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[8..12] == b".FIT"
}

/// Rewrite a FIT file to carry exactly one synthetic device-info record.
///
/// Non-FIT input passes through untouched, and any parse failure falls
/// back to the original bytes so an odd file still gets uploaded as-is.
pub fn wrap_device_info(bytes: &[u8]) -> Vec<u8> {
    if !is_fit(bytes) {
        return bytes.to_vec();
    }
    match rewrite(bytes) {
        Ok(out) => {
            tracing::debug!(product = PRODUCT_FORERUNNER_245, "Injected synthetic Garmin device info");
            out
        }
        Err(e) => {
            tracing::warn!(error = %e, "FIT device rewrite failed; uploading the original file");
            bytes.to_vec()
        }
    }
}

struct FieldDef {
    num: u8,
    size: u8,
}

struct MessageDef {
    global: u16,
    fields: Vec<FieldDef>,
    /// Total developer-field bytes appended to each data message.
    dev_bytes: usize,
}

enum Record {
    Definition { raw: Vec<u8>, global: u16 },
    Data {
        raw: Vec<u8>,
        global: u16,
        /// Offset of the heart-rate byte within `raw`, for record
        /// messages that carry one.
        hr_offset: Option<usize>,
    },
}

impl Record {
    fn raw(&self) -> &[u8] {
        match self {
            Record::Definition { raw, .. } | Record::Data { raw, .. } => raw,
        }
    }

    fn global(&self) -> u16 {
        match self {
            Record::Definition { global, .. } | Record::Data { global, .. } => *global,
        }
    }
}

fn rewrite(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let header_size = bytes[0] as usize;
    if header_size != 12 && header_size != 14 {
        return Err(DecodeError::malformed(
            "fit",
            format!("unexpected header size {header_size}"),
        ));
    }
    if bytes.len() < header_size + 2 {
        return Err(DecodeError::malformed("fit", "truncated file"));
    }
    let data_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let data_end = header_size + data_size;
    if data_end + 2 > bytes.len() {
        return Err(DecodeError::malformed(
            "fit",
            "declared data size exceeds file length",
        ));
    }

    let records = parse_records(&bytes[header_size..data_end])?;
    let mut kept: Vec<Record> = records
        .into_iter()
        .filter(|r| r.global() != DEVICE_INFO_GLOBAL)
        .collect();
    backfill_heart_rate(&mut kept);

    let (definition, data) = synthetic_device_info();
    kept.push(Record::Definition {
        raw: definition,
        global: DEVICE_INFO_GLOBAL,
    });
    kept.push(Record::Data {
        raw: data,
        global: DEVICE_INFO_GLOBAL,
        hr_offset: None,
    });

    let body_len: usize = kept.iter().map(|r| r.raw().len()).sum();
    let mut out = Vec::with_capacity(header_size + body_len + 2);
    out.extend_from_slice(&bytes[..header_size]);
    out[4..8].copy_from_slice(&(body_len as u32).to_le_bytes());
    if header_size == 14 {
        let header_crc = crc16(&out[..12]);
        out[12..14].copy_from_slice(&header_crc.to_le_bytes());
    }
    for record in &kept {
        out.extend_from_slice(record.raw());
    }
    let file_crc = crc16(&out);
    out.extend_from_slice(&file_crc.to_le_bytes());
    Ok(out)
}

/// Walk the record stream, keeping raw bytes and enough structure to
/// identify device-info messages and heart-rate byte offsets.
fn parse_records(body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let mut defs: HashMap<u8, MessageDef> = HashMap::new();
    let mut records = Vec::new();
    let mut pos = 0usize;

    let need = |pos: usize, n: usize| {
        if pos + n > body.len() {
            Err(DecodeError::malformed("fit", "truncated record"))
        } else {
            Ok(())
        }
    };

    while pos < body.len() {
        let header = body[pos];
        let compressed = header & 0x80 != 0;
        if !compressed && header & 0x40 != 0 {
            // Definition message.
            let start = pos;
            let has_dev = header & 0x20 != 0;
            let local = header & 0x0F;
            need(pos, 6)?;
            let big_endian = body[pos + 2] == 1;
            let global = if big_endian {
                u16::from_be_bytes([body[pos + 3], body[pos + 4]])
            } else {
                u16::from_le_bytes([body[pos + 3], body[pos + 4]])
            };
            let num_fields = body[pos + 5] as usize;
            pos += 6;
            need(pos, num_fields * 3)?;
            let mut fields = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                fields.push(FieldDef {
                    num: body[pos],
                    size: body[pos + 1],
                });
                pos += 3;
            }
            let mut dev_bytes = 0usize;
            if has_dev {
                need(pos, 1)?;
                let n = body[pos] as usize;
                pos += 1;
                need(pos, n * 3)?;
                for _ in 0..n {
                    dev_bytes += body[pos + 1] as usize;
                    pos += 3;
                }
            }
            defs.insert(
                local,
                MessageDef {
                    global,
                    fields,
                    dev_bytes,
                },
            );
            records.push(Record::Definition {
                raw: body[start..pos].to_vec(),
                global,
            });
        } else {
            // Data message, normal or compressed-timestamp header.
            let local = if compressed {
                (header >> 5) & 0x03
            } else {
                header & 0x0F
            };
            let def = defs.get(&local).ok_or_else(|| {
                DecodeError::malformed("fit", format!("data message for undefined local type {local}"))
            })?;
            let mut size = 0usize;
            let mut hr_offset = None;
            for field in &def.fields {
                if def.global == RECORD_GLOBAL && field.num == RECORD_HR_FIELD && field.size == 1 {
                    hr_offset = Some(1 + size);
                }
                size += field.size as usize;
            }
            size += def.dev_bytes;
            need(pos, 1 + size)?;
            records.push(Record::Data {
                raw: body[pos..pos + 1 + size].to_vec(),
                global: def.global,
                hr_offset,
            });
            pos += 1 + size;
        }
    }
    Ok(records)
}

/// Replace invalid heart-rate bytes with the nearest valid reading,
/// searching forward first, then backward. A file with no valid reading
/// at all is left untouched.
fn backfill_heart_rate(records: &mut [Record]) {
    let values: Vec<(usize, u8)> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| match r {
            Record::Data {
                raw,
                hr_offset: Some(off),
                ..
            } => Some((i, raw[*off])),
            _ => None,
        })
        .collect();

    for vi in 0..values.len() {
        let (ri, value) = values[vi];
        if value != HR_INVALID {
            continue;
        }
        let replacement = values[vi + 1..]
            .iter()
            .map(|&(_, v)| v)
            .find(|&v| v != HR_INVALID)
            .or_else(|| {
                values[..vi]
                    .iter()
                    .rev()
                    .map(|&(_, v)| v)
                    .find(|&v| v != HR_INVALID)
            });
        if let Some(v) = replacement {
            if let Record::Data {
                raw,
                hr_offset: Some(off),
                ..
            } = &mut records[ri]
            {
                raw[*off] = v;
            }
        }
    }
}

/// The definition and data bytes of the injected device-info record,
/// little endian on local message type 0.
fn synthetic_device_info() -> (Vec<u8>, Vec<u8>) {
    let definition = vec![
        0x40, // definition header, local type 0
        0x00, // reserved
        0x00, // little endian
        DEVICE_INFO_GLOBAL as u8,
        0x00,
        6, // field count
        0, 1, BT_UINT8, // device_index
        2, 2, BT_UINT16, // manufacturer
        3, 4, BT_UINT32Z, // serial_number
        4, 2, BT_UINT16, // product
        5, 2, BT_UINT16, // software_version
        25, 1, BT_ENUM, // source_type
    ];

    let mut data = Vec::with_capacity(13);
    data.push(0x00); // data header, local type 0
    data.push(DEVICE_INDEX_CREATOR);
    data.extend_from_slice(&MANUFACTURER_GARMIN.to_le_bytes());
    data.extend_from_slice(&SERIAL_NUMBER.to_le_bytes());
    data.extend_from_slice(&PRODUCT_FORERUNNER_245.to_le_bytes());
    data.extend_from_slice(&SOFTWARE_VERSION_X100.to_le_bytes());
    data.push(SOURCE_TYPE_LOCAL);
    (definition, data)
}

/// The FIT CRC-16 (reflected 0x8005, zero init). Appending the CRC
/// little-endian leaves the whole-file CRC at zero.
fn crc16(data: &[u8]) -> u16 {
    const TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];
    let mut crc: u16 = 0;
    for &byte in data {
        let mut tmp = TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[(byte & 0xF) as usize];
        tmp = TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[((byte >> 4) & 0xF) as usize];
    }
    crc
}
