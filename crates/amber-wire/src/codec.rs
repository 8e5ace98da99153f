// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode the tagged snapshot record stream.
// Author: Lukas Bower

//! Encode/decode helpers for the snapshot record stream.
//!
//! A snapshot travels as a sequence of length-prefixed frames: a child-list
//! header, one child record per monitored child, an attachment-table header,
//! and one frame per attachment. Nested structures are encoded inline within
//! their owning frame.

use crate::types::*;

/// Record tags used by the snapshot stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordTag {
    ChildList = 1,
    ChildInfo = 2,
    AttachmentTable = 3,
    Attachment = 4,
}

impl TryFrom<u8> for RecordTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use RecordTag::*;
        Ok(match value {
            1 => ChildList,
            2 => ChildInfo,
            3 => AttachmentTable,
            4 => Attachment,
            other => return Err(WireError::Unsupported(other)),
        })
    }
}

/// Encode a snapshot into its wire representation.
#[must_use]
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut stream = Vec::new();

    let mut payload = Vec::new();
    payload.extend_from_slice(&(snapshot.children.len() as u32).to_le_bytes());
    stream.extend_from_slice(&finish(RecordTag::ChildList, &payload));

    for child in &snapshot.children {
        let mut payload = Vec::new();
        put_child_info(&mut payload, child);
        stream.extend_from_slice(&finish(RecordTag::ChildInfo, &payload));
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&(snapshot.attachments.len() as u32).to_le_bytes());
    stream.extend_from_slice(&finish(RecordTag::AttachmentTable, &payload));

    for attachment in &snapshot.attachments {
        let mut payload = Vec::new();
        payload.extend_from_slice(&attachment.size.to_le_bytes());
        payload.extend_from_slice(&attachment.bytes);
        stream.extend_from_slice(&finish(RecordTag::Attachment, &payload));
    }

    stream
}

/// Decode a snapshot from its wire representation.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, WireError> {
    let mut stream = StreamCursor::new(bytes);

    let header = stream.next_record(RecordTag::ChildList)?;
    let child_count = {
        let mut cursor = Cursor::new(header);
        read_u32(&mut cursor)? as usize
    };
    if child_count > bytes.len() {
        // A count larger than the whole stream cannot be honest.
        return Err(WireError::Truncated);
    }

    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let payload = stream.next_record(RecordTag::ChildInfo)?;
        let mut cursor = Cursor::new(payload);
        let child = read_child_info(&mut cursor)?;
        if cursor.remaining() != 0 {
            return Err(WireError::LengthMismatch {
                declared: payload.len() as u32,
                actual: payload.len() - cursor.remaining(),
            });
        }
        children.push(child);
    }

    let header = stream.next_record(RecordTag::AttachmentTable)?;
    let attachment_count = {
        let mut cursor = Cursor::new(header);
        read_u32(&mut cursor)?
    };
    if attachment_count as usize > bytes.len() {
        return Err(WireError::Truncated);
    }

    let mut attachments = Vec::with_capacity(attachment_count as usize);
    for _ in 0..attachment_count {
        let payload = stream.next_record(RecordTag::Attachment)?;
        let mut cursor = Cursor::new(payload);
        let size = read_u64(&mut cursor)?;
        let bytes = cursor.take_remaining();
        if size != bytes.len() as u64 {
            return Err(WireError::LengthMismatch {
                declared: size as u32,
                actual: bytes.len(),
            });
        }
        attachments.push(Attachment {
            size,
            bytes: bytes.to_vec(),
        });
    }

    if stream.remaining() != 0 {
        return Err(WireError::TrailingBytes);
    }

    let snapshot = Snapshot {
        children,
        attachments,
    };
    validate_attachment_refs(&snapshot)?;
    Ok(snapshot)
}

fn validate_attachment_refs(snapshot: &Snapshot) -> Result<(), WireError> {
    let count = snapshot.attachments.len() as u32;
    let check = |reference: Option<AttachmentRef>| -> Result<(), WireError> {
        match reference {
            Some(r) if r.index() >= count => Err(WireError::AttachmentOutOfRange {
                index: r.index(),
                count,
            }),
            _ => Ok(()),
        }
    };
    for child in &snapshot.children {
        check(child.binary)?;
        for dataspace in &child.ram.dataspaces {
            check(dataspace.content)?;
        }
    }
    Ok(())
}

fn put_child_info(buffer: &mut Vec<u8>, child: &ChildInfo) {
    put_string(buffer, &child.label);
    put_bool(buffer, child.bootstrapped);
    put_pd_session(buffer, &child.pd);
    put_ram_session(buffer, &child.ram);
    put_cpu_session(buffer, &child.cpu);
    put_option(buffer, child.rm.as_ref(), put_rm_session);
    put_option(buffer, child.log.as_ref(), put_passive_session);
    put_option(buffer, child.timer.as_ref(), put_passive_session);
    put_option(buffer, child.rom.as_ref(), put_passive_session);
    buffer.extend_from_slice(&(child.capability_map.len() as u32).to_le_bytes());
    for (badge, kcap) in &child.capability_map {
        put_badge(buffer, *badge);
        put_kcap(buffer, *kcap);
    }
    put_option(buffer, child.binary.as_ref(), |buffer, reference| {
        buffer.extend_from_slice(&reference.index().to_le_bytes());
    });
}

fn read_child_info(cursor: &mut Cursor<'_>) -> Result<ChildInfo, WireError> {
    let label = read_string(cursor)?;
    let bootstrapped = read_bool(cursor)?;
    let pd = read_pd_session(cursor)?;
    let ram = read_ram_session(cursor)?;
    let cpu = read_cpu_session(cursor)?;
    let rm = read_option(cursor, read_rm_session)?;
    let log = read_option(cursor, read_passive_session)?;
    let timer = read_option(cursor, read_passive_session)?;
    let rom = read_option(cursor, read_passive_session)?;
    let map_count = read_u32(cursor)? as usize;
    if map_count > cursor.remaining() {
        return Err(WireError::Truncated);
    }
    let mut capability_map = Vec::with_capacity(map_count);
    for _ in 0..map_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        capability_map.push((badge, kcap));
    }
    let binary = read_option(cursor, |cursor| {
        Ok(AttachmentRef::from_raw(read_u32(cursor)?))
    })?;
    Ok(ChildInfo {
        label,
        bootstrapped,
        pd,
        ram,
        cpu,
        rm,
        log,
        timer,
        rom,
        capability_map,
        binary,
    })
}

fn put_session_info(buffer: &mut Vec<u8>, base: &SessionInfo) {
    put_string(buffer, &base.creation_args);
    put_string(buffer, &base.upgrade_args);
    put_badge(buffer, base.badge);
    put_kcap(buffer, base.kcap);
    put_bool(buffer, base.bootstrapped);
}

fn read_session_info(cursor: &mut Cursor<'_>) -> Result<SessionInfo, WireError> {
    let creation_args = read_string(cursor)?;
    let upgrade_args = read_string(cursor)?;
    let badge = read_badge(cursor)?;
    let kcap = read_kcap(cursor)?;
    let bootstrapped = read_bool(cursor)?;
    Ok(SessionInfo {
        creation_args,
        upgrade_args,
        badge,
        kcap,
        bootstrapped,
    })
}

fn put_pd_session(buffer: &mut Vec<u8>, session: &PdSessionInfo) {
    put_session_info(buffer, &session.base);
    put_region_map(buffer, &session.address_space);
    put_region_map(buffer, &session.stack_area);
    put_region_map(buffer, &session.linker_area);
    buffer.extend_from_slice(&(session.signal_sources.len() as u32).to_le_bytes());
    for source in &session.signal_sources {
        put_badge(buffer, source.badge);
        put_kcap(buffer, source.kcap);
    }
    buffer.extend_from_slice(&(session.signal_contexts.len() as u32).to_le_bytes());
    for context in &session.signal_contexts {
        put_badge(buffer, context.badge);
        put_kcap(buffer, context.kcap);
        put_badge(buffer, context.source_badge);
        buffer.extend_from_slice(&context.imprint.to_le_bytes());
    }
    buffer.extend_from_slice(&(session.native_caps.len() as u32).to_le_bytes());
    for native in &session.native_caps {
        put_badge(buffer, native.badge);
        put_kcap(buffer, native.kcap);
        put_badge(buffer, native.ep_badge);
    }
}

fn read_pd_session(cursor: &mut Cursor<'_>) -> Result<PdSessionInfo, WireError> {
    let base = read_session_info(cursor)?;
    let address_space = read_region_map(cursor)?;
    let stack_area = read_region_map(cursor)?;
    let linker_area = read_region_map(cursor)?;
    let source_count = read_counted(cursor)?;
    let mut signal_sources = Vec::with_capacity(source_count);
    for _ in 0..source_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        signal_sources.push(SignalSourceInfo { badge, kcap });
    }
    let context_count = read_counted(cursor)?;
    let mut signal_contexts = Vec::with_capacity(context_count);
    for _ in 0..context_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        let source_badge = read_badge(cursor)?;
        let imprint = read_u64(cursor)?;
        signal_contexts.push(SignalContextInfo {
            badge,
            kcap,
            source_badge,
            imprint,
        });
    }
    let native_count = read_counted(cursor)?;
    let mut native_caps = Vec::with_capacity(native_count);
    for _ in 0..native_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        let ep_badge = read_badge(cursor)?;
        native_caps.push(NativeCapInfo {
            badge,
            kcap,
            ep_badge,
        });
    }
    Ok(PdSessionInfo {
        base,
        address_space,
        stack_area,
        linker_area,
        signal_sources,
        signal_contexts,
        native_caps,
    })
}

fn put_region_map(buffer: &mut Vec<u8>, map: &RegionMapInfo) {
    put_badge(buffer, map.badge);
    put_kcap(buffer, map.kcap);
    put_badge(buffer, map.ds_badge);
    put_badge(buffer, map.sigh_badge);
    buffer.extend_from_slice(&(map.attached.len() as u32).to_le_bytes());
    for region in &map.attached {
        put_badge(buffer, region.ds_badge);
        buffer.extend_from_slice(&region.rel_addr.to_le_bytes());
        buffer.extend_from_slice(&region.size.to_le_bytes());
        buffer.extend_from_slice(&region.offset.to_le_bytes());
        put_bool(buffer, region.executable);
    }
}

fn read_region_map(cursor: &mut Cursor<'_>) -> Result<RegionMapInfo, WireError> {
    let badge = read_badge(cursor)?;
    let kcap = read_kcap(cursor)?;
    let ds_badge = read_badge(cursor)?;
    let sigh_badge = read_badge(cursor)?;
    let region_count = read_counted(cursor)?;
    let mut attached = Vec::with_capacity(region_count);
    for _ in 0..region_count {
        let ds_badge = read_badge(cursor)?;
        let rel_addr = read_u64(cursor)?;
        let size = read_u64(cursor)?;
        let offset = read_u64(cursor)?;
        let executable = read_bool(cursor)?;
        attached.push(AttachedRegionInfo {
            ds_badge,
            rel_addr,
            size,
            offset,
            executable,
        });
    }
    Ok(RegionMapInfo {
        badge,
        kcap,
        ds_badge,
        sigh_badge,
        attached,
    })
}

fn put_cpu_session(buffer: &mut Vec<u8>, session: &CpuSessionInfo) {
    put_session_info(buffer, &session.base);
    put_badge(buffer, session.sigh_badge);
    put_affinity(buffer, session.affinity);
    buffer.extend_from_slice(&(session.threads.len() as u32).to_le_bytes());
    for thread in &session.threads {
        put_badge(buffer, thread.badge);
        put_kcap(buffer, thread.kcap);
        put_string(buffer, &thread.name);
        buffer.extend_from_slice(&thread.weight.to_le_bytes());
        put_affinity(buffer, thread.affinity);
        buffer.extend_from_slice(&thread.utcb.to_le_bytes());
        put_bool(buffer, thread.started);
        put_bool(buffer, thread.paused);
        put_bool(buffer, thread.single_step);
        put_badge(buffer, thread.sigh_badge);
        put_registers(buffer, &thread.registers);
        buffer.extend_from_slice(&thread.priority.to_le_bytes());
        buffer.extend_from_slice(&thread.deadline.to_le_bytes());
    }
}

fn read_cpu_session(cursor: &mut Cursor<'_>) -> Result<CpuSessionInfo, WireError> {
    let base = read_session_info(cursor)?;
    let sigh_badge = read_badge(cursor)?;
    let affinity = read_affinity(cursor)?;
    let thread_count = read_counted(cursor)?;
    let mut threads = Vec::with_capacity(thread_count);
    for _ in 0..thread_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        let name = read_string(cursor)?;
        let weight = read_u64(cursor)?;
        let affinity = read_affinity(cursor)?;
        let utcb = read_u64(cursor)?;
        let started = read_bool(cursor)?;
        let paused = read_bool(cursor)?;
        let single_step = read_bool(cursor)?;
        let sigh_badge = read_badge(cursor)?;
        let registers = read_registers(cursor)?;
        let priority = read_u32(cursor)?;
        let deadline = read_u32(cursor)?;
        threads.push(ThreadInfo {
            badge,
            kcap,
            name,
            weight,
            affinity,
            utcb,
            started,
            paused,
            single_step,
            sigh_badge,
            registers,
            priority,
            deadline,
        });
    }
    Ok(CpuSessionInfo {
        base,
        sigh_badge,
        affinity,
        threads,
    })
}

fn put_ram_session(buffer: &mut Vec<u8>, session: &RamSessionInfo) {
    put_session_info(buffer, &session.base);
    buffer.extend_from_slice(&(session.dataspaces.len() as u32).to_le_bytes());
    for dataspace in &session.dataspaces {
        put_badge(buffer, dataspace.badge);
        put_kcap(buffer, dataspace.kcap);
        buffer.extend_from_slice(&dataspace.size.to_le_bytes());
        put_bool(buffer, dataspace.cached);
        put_option(buffer, dataspace.content.as_ref(), |buffer, reference| {
            buffer.extend_from_slice(&reference.index().to_le_bytes());
        });
    }
}

fn read_ram_session(cursor: &mut Cursor<'_>) -> Result<RamSessionInfo, WireError> {
    let base = read_session_info(cursor)?;
    let dataspace_count = read_counted(cursor)?;
    let mut dataspaces = Vec::with_capacity(dataspace_count);
    for _ in 0..dataspace_count {
        let badge = read_badge(cursor)?;
        let kcap = read_kcap(cursor)?;
        let size = read_u64(cursor)?;
        let cached = read_bool(cursor)?;
        let content = read_option(cursor, |cursor| {
            Ok(AttachmentRef::from_raw(read_u32(cursor)?))
        })?;
        dataspaces.push(DataspaceInfo {
            badge,
            kcap,
            size,
            cached,
            content,
        });
    }
    Ok(RamSessionInfo { base, dataspaces })
}

fn put_rm_session(buffer: &mut Vec<u8>, session: &RmSessionInfo) {
    put_session_info(buffer, &session.base);
    buffer.extend_from_slice(&(session.region_maps.len() as u32).to_le_bytes());
    for map in &session.region_maps {
        put_region_map(buffer, map);
    }
}

fn read_rm_session(cursor: &mut Cursor<'_>) -> Result<RmSessionInfo, WireError> {
    let base = read_session_info(cursor)?;
    let map_count = read_counted(cursor)?;
    let mut region_maps = Vec::with_capacity(map_count);
    for _ in 0..map_count {
        region_maps.push(read_region_map(cursor)?);
    }
    Ok(RmSessionInfo { base, region_maps })
}

fn put_passive_session(buffer: &mut Vec<u8>, session: &PassiveSessionInfo) {
    put_session_info(buffer, &session.base);
}

fn read_passive_session(cursor: &mut Cursor<'_>) -> Result<PassiveSessionInfo, WireError> {
    let base = read_session_info(cursor)?;
    Ok(PassiveSessionInfo { base })
}

fn put_affinity(buffer: &mut Vec<u8>, affinity: AffinityLocation) {
    buffer.extend_from_slice(&affinity.xpos.to_le_bytes());
    buffer.extend_from_slice(&affinity.ypos.to_le_bytes());
    buffer.extend_from_slice(&affinity.width.to_le_bytes());
    buffer.extend_from_slice(&affinity.height.to_le_bytes());
}

fn read_affinity(cursor: &mut Cursor<'_>) -> Result<AffinityLocation, WireError> {
    let xpos = read_u32(cursor)? as i32;
    let ypos = read_u32(cursor)? as i32;
    let width = read_u32(cursor)?;
    let height = read_u32(cursor)?;
    Ok(AffinityLocation {
        xpos,
        ypos,
        width,
        height,
    })
}

fn put_registers(buffer: &mut Vec<u8>, registers: &ThreadRegisters) {
    for word in registers.gpr {
        buffer.extend_from_slice(&word.to_le_bytes());
    }
    buffer.extend_from_slice(&registers.ip.to_le_bytes());
    buffer.extend_from_slice(&registers.sp.to_le_bytes());
}

fn read_registers(cursor: &mut Cursor<'_>) -> Result<ThreadRegisters, WireError> {
    let mut gpr = [0u64; 16];
    for word in &mut gpr {
        *word = read_u64(cursor)?;
    }
    let ip = read_u64(cursor)?;
    let sp = read_u64(cursor)?;
    Ok(ThreadRegisters { gpr, ip, sp })
}

fn put_option<T>(buffer: &mut Vec<u8>, value: Option<&T>, put: impl FnOnce(&mut Vec<u8>, &T)) {
    match value {
        Some(value) => {
            buffer.push(1);
            put(buffer, value);
        }
        None => buffer.push(0),
    }
}

fn read_option<T>(
    cursor: &mut Cursor<'_>,
    read: impl FnOnce(&mut Cursor<'_>) -> Result<T, WireError>,
) -> Result<Option<T>, WireError> {
    match read_u8(cursor)? {
        0 => Ok(None),
        1 => Ok(Some(read(cursor)?)),
        other => Err(WireError::InvalidFlag(other)),
    }
}

fn put_badge(buffer: &mut Vec<u8>, badge: Badge) {
    buffer.extend_from_slice(&badge.into_raw().to_le_bytes());
}

fn read_badge(cursor: &mut Cursor<'_>) -> Result<Badge, WireError> {
    Ok(Badge::from_raw(read_u16(cursor)?))
}

fn put_kcap(buffer: &mut Vec<u8>, kcap: Kcap) {
    buffer.extend_from_slice(&kcap.into_raw().to_le_bytes());
}

fn read_kcap(cursor: &mut Cursor<'_>) -> Result<Kcap, WireError> {
    Ok(Kcap::from_raw(read_u64(cursor)?))
}

fn put_bool(buffer: &mut Vec<u8>, value: bool) {
    buffer.push(u8::from(value));
}

fn read_bool(cursor: &mut Cursor<'_>) -> Result<bool, WireError> {
    match read_u8(cursor)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidFlag(other)),
    }
}

fn put_string(buffer: &mut Vec<u8>, value: &str) {
    let len: u16 = value
        .len()
        .try_into()
        .expect("string length exceeds record limit");
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

fn read_string(cursor: &mut Cursor<'_>) -> Result<String, WireError> {
    let len = read_u16(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| WireError::Truncated)?;
    let text = std::str::from_utf8(&buf).map_err(|_| WireError::InvalidUtf8)?;
    Ok(text.to_owned())
}

/// Read a u32 element count, bounding it by the bytes actually left so a
/// hostile count cannot drive a huge allocation.
fn read_counted(cursor: &mut Cursor<'_>) -> Result<usize, WireError> {
    let count = read_u32(cursor)? as usize;
    if count > cursor.remaining() {
        return Err(WireError::Truncated);
    }
    Ok(count)
}

fn read_u8(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let mut buf = [0u8; 1];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| WireError::Truncated)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<'_>) -> Result<u16, WireError> {
    let mut buf = [0u8; 2];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| WireError::Truncated)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<'_>) -> Result<u32, WireError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| WireError::Truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<'_>) -> Result<u64, WireError> {
    let mut buf = [0u8; 8];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| WireError::Truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn finish(tag: RecordTag, payload: &[u8]) -> Vec<u8> {
    let size = payload
        .len()
        .checked_add(5)
        .expect("payload length overflow");
    let mut buffer = Vec::with_capacity(size);
    buffer.extend_from_slice(&(size as u32).to_le_bytes());
    buffer.push(tag as u8);
    buffer.extend_from_slice(payload);
    buffer
}

struct StreamCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pull the next frame off the stream and require the expected tag.
    fn next_record(&mut self, expected: RecordTag) -> Result<&'a [u8], WireError> {
        if self.remaining() < 5 {
            return Err(WireError::Truncated);
        }
        let header = &self.buf[self.pos..];
        let declared =
            u32::from_le_bytes(header[..4].try_into().expect("slice length checked")) as usize;
        if declared < 5 || declared > self.remaining() {
            return Err(WireError::LengthMismatch {
                declared: declared as u32,
                actual: self.remaining(),
            });
        }
        let tag = RecordTag::try_from(header[4])?;
        if tag != expected {
            return Err(WireError::Unsupported(header[4]));
        }
        let payload = &self.buf[self.pos + 5..self.pos + declared];
        self.pos += declared;
        Ok(payload)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ()> {
        let end = self.pos.saturating_add(out.len());
        if end > self.buf.len() {
            return Err(());
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        let base = SessionInfo {
            creation_args: "ram_quota=8192, label=\"hello\"".to_owned(),
            upgrade_args: String::new(),
            badge: Badge::from_raw(7),
            kcap: Kcap::from_raw(0x1070),
            bootstrapped: true,
        };
        let child = ChildInfo {
            label: "hello".to_owned(),
            bootstrapped: true,
            pd: PdSessionInfo {
                base: base.clone(),
                ..PdSessionInfo::default()
            },
            ram: RamSessionInfo {
                base: base.clone(),
                dataspaces: vec![DataspaceInfo {
                    badge: Badge::from_raw(9),
                    kcap: Kcap::from_raw(0x1090),
                    size: 4096,
                    cached: true,
                    content: Some(AttachmentRef::from_raw(0)),
                }],
            },
            cpu: CpuSessionInfo {
                base,
                ..CpuSessionInfo::default()
            },
            capability_map: vec![(Badge::from_raw(7), Kcap::from_raw(0x1070))],
            ..ChildInfo::default()
        };
        Snapshot {
            children: vec![child],
            attachments: vec![Attachment::from_bytes(vec![0xAB; 4096])],
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = sample_snapshot();
        let bytes = encode_snapshot(&snapshot);
        let decoded = decode_snapshot(&bytes).expect("decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn detect_truncated_stream() {
        let mut bytes = encode_snapshot(&sample_snapshot());
        bytes.truncate(bytes.len() - 7);
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(WireError::Truncated | WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn detect_trailing_bytes() {
        let mut bytes = encode_snapshot(&sample_snapshot());
        bytes.extend_from_slice(&[0u8; 3]);
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn reject_out_of_range_attachment_ref() {
        let mut snapshot = sample_snapshot();
        snapshot.children[0].ram.dataspaces[0].content = Some(AttachmentRef::from_raw(5));
        let bytes = encode_snapshot(&snapshot);
        assert_eq!(
            decode_snapshot(&bytes),
            Err(WireError::AttachmentOutOfRange { index: 5, count: 1 })
        );
    }

    #[test]
    fn reject_invalid_flag_byte() {
        let snapshot = sample_snapshot();
        let mut bytes = encode_snapshot(&snapshot);
        // The child-list frame is 9 bytes; the child label follows the next
        // frame header, and the bootstrapped flag trails the label.
        let flag_pos = 9 + 5 + 2 + "hello".len();
        bytes[flag_pos] = 7;
        assert_eq!(decode_snapshot(&bytes), Err(WireError::InvalidFlag(7)));
    }
}
