//! Wire representation of the message envelope. All numbers are big-endian (network byte
//!  order) - this is a project constant, not negotiated on the link.
//!
//! ```ascii
//! 0: message kind (u8, see [MessageKind])
//! 1: packet id (u32)
//! 5: flags (u8) - bit 0: need_ack, other bits must be zero
//! 6: timestamp (u64, microseconds since epoch)
//! 14: variant fields, depending on the kind
//! ```

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::packet::*;

const FLAG_NEED_ACK: u8 = 0x01;

impl Envelope {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message.kind().into());
        buf.put_u32(self.header.packet_id);
        buf.put_u8(if self.header.need_ack { FLAG_NEED_ACK } else { 0 });
        buf.put_u64(self.header.timestamp_us);

        match &self.message {
            RadioMessage::Ack { ack_id } => buf.put_u32(*ack_id),
            RadioMessage::SyncRequest(data) => {
                buf.put_u32(data.ack_timeout_ms);
                buf.put_u32(data.max_retries);
            }
            RadioMessage::SyncResponse(data) => put_bool(buf, data.success),
            RadioMessage::ConfigRequest(data) => Self::ser_config_request(data, buf),
            RadioMessage::ConfigResponse(data) => put_bool(buf, data.success),
            RadioMessage::Gps(data) => {
                buf.put_f64(data.easting);
                buf.put_f64(data.northing);
                buf.put_f64(data.altitude);
                buf.put_f64(data.heading);
                buf.put_u32(data.epsg_code);
            }
            RadioMessage::Ping(data) => {
                buf.put_u32(data.frequency);
                buf.put_f64(data.amplitude);
                buf.put_f64(data.easting);
                buf.put_f64(data.northing);
                buf.put_f64(data.altitude);
                buf.put_u32(data.epsg_code);
            }
            RadioMessage::LocationEstimate(data) => {
                buf.put_u32(data.frequency);
                buf.put_f64(data.easting);
                buf.put_f64(data.northing);
                buf.put_u32(data.epsg_code);
            }
            RadioMessage::StartResponse(data) => put_bool(buf, data.success),
            RadioMessage::StopResponse(data) => put_bool(buf, data.success),
            RadioMessage::StartRequest | RadioMessage::StopRequest | RadioMessage::Error => {}
        }
    }

    fn ser_config_request(data: &ConfigRequestData, buf: &mut BytesMut) {
        buf.put_f32(data.gain);
        buf.put_u32(data.sampling_rate);
        buf.put_u32(data.center_frequency);
        buf.put_u32(data.run_num);
        put_bool(buf, data.enable_test_data);
        buf.put_u32(data.ping_width_ms);
        buf.put_u32(data.ping_min_snr);
        buf.put_f32(data.ping_max_len_mult);
        buf.put_f32(data.ping_min_len_mult);
        buf.put_u32_varint(data.target_frequencies.len() as u32);
        for freq in &data.target_frequencies {
            buf.put_u32(*freq);
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Envelope> {
        let mut buf = buf;

        let kind_byte = buf.try_get_u8()?;
        let kind = MessageKind::try_from(kind_byte)
            .map_err(|_| anyhow!("unrecognized message kind {}", kind_byte))?;

        let packet_id = buf.try_get_u32()?;
        let flags = buf.try_get_u8()?;
        if flags & !FLAG_NEED_ACK != 0 {
            return Err(anyhow!("unsupported flag bits 0x{:02x}", flags));
        }
        let timestamp_us = buf.try_get_u64()?;

        let message = match kind {
            MessageKind::Ack => RadioMessage::Ack {
                ack_id: buf.try_get_u32()?,
            },
            MessageKind::SyncRequest => RadioMessage::SyncRequest(SyncRequestData {
                ack_timeout_ms: buf.try_get_u32()?,
                max_retries: buf.try_get_u32()?,
            }),
            MessageKind::SyncResponse => RadioMessage::SyncResponse(SyncResponseData {
                success: try_get_bool(&mut buf)?,
            }),
            MessageKind::ConfigRequest => Self::deser_config_request(&mut buf)?,
            MessageKind::ConfigResponse => RadioMessage::ConfigResponse(ConfigResponseData {
                success: try_get_bool(&mut buf)?,
            }),
            MessageKind::Gps => RadioMessage::Gps(GpsData {
                easting: try_get_f64(&mut buf)?,
                northing: try_get_f64(&mut buf)?,
                altitude: try_get_f64(&mut buf)?,
                heading: try_get_f64(&mut buf)?,
                epsg_code: buf.try_get_u32()?,
            }),
            MessageKind::Ping => RadioMessage::Ping(PingData {
                frequency: buf.try_get_u32()?,
                amplitude: try_get_f64(&mut buf)?,
                easting: try_get_f64(&mut buf)?,
                northing: try_get_f64(&mut buf)?,
                altitude: try_get_f64(&mut buf)?,
                epsg_code: buf.try_get_u32()?,
            }),
            MessageKind::LocationEstimate => RadioMessage::LocationEstimate(LocEstData {
                frequency: buf.try_get_u32()?,
                easting: try_get_f64(&mut buf)?,
                northing: try_get_f64(&mut buf)?,
                epsg_code: buf.try_get_u32()?,
            }),
            MessageKind::StartRequest => RadioMessage::StartRequest,
            MessageKind::StartResponse => RadioMessage::StartResponse(StartResponseData {
                success: try_get_bool(&mut buf)?,
            }),
            MessageKind::StopRequest => RadioMessage::StopRequest,
            MessageKind::StopResponse => RadioMessage::StopResponse(StopResponseData {
                success: try_get_bool(&mut buf)?,
            }),
            MessageKind::Error => RadioMessage::Error,
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after envelope", buf.remaining()));
        }

        Ok(Envelope {
            header: PacketHeader {
                packet_id,
                need_ack: flags & FLAG_NEED_ACK != 0,
                timestamp_us,
            },
            message,
        })
    }

    fn deser_config_request(buf: &mut &[u8]) -> anyhow::Result<RadioMessage> {
        let gain = try_get_f32(buf)?;
        let sampling_rate = buf.try_get_u32()?;
        let center_frequency = buf.try_get_u32()?;
        let run_num = buf.try_get_u32()?;
        let enable_test_data = try_get_bool(buf)?;
        let ping_width_ms = buf.try_get_u32()?;
        let ping_min_snr = buf.try_get_u32()?;
        let ping_max_len_mult = try_get_f32(buf)?;
        let ping_min_len_mult = try_get_f32(buf)?;

        let num_frequencies = buf.try_get_u32_varint()?;
        let mut target_frequencies = Vec::with_capacity(num_frequencies.min(1024) as usize);
        for _ in 0..num_frequencies {
            target_frequencies.push(buf.try_get_u32()?);
        }

        Ok(RadioMessage::ConfigRequest(ConfigRequestData {
            gain,
            sampling_rate,
            center_frequency,
            run_num,
            enable_test_data,
            ping_width_ms,
            ping_min_snr,
            ping_max_len_mult,
            ping_min_len_mult,
            target_frequencies,
        }))
    }
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

fn try_get_bool(buf: &mut &[u8]) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid value for a boolean: {}", b)),
    }
}

fn try_get_f32(buf: &mut &[u8]) -> anyhow::Result<f32> {
    Ok(f32::from_bits(buf.try_get_u32()?))
}

fn try_get_f64(buf: &mut &[u8]) -> anyhow::Result<f64> {
    Ok(f64::from_bits(buf.try_get_u64()?))
}
