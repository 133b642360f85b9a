//! BM13xx bus framing: command encoding and result decoding.
//!
//! Commands travel host→chain as `55 AA` frames with a CRC-5 (CRC-16 for
//! job frames). Results travel chain→host as fixed 11-byte `AA 55` frames
//! carrying either a found nonce or a register read reply. The decoder
//! resynchronizes on garbage by skipping a byte at a time; bad frames are
//! counted, never surfaced as stream errors.

use bitvec::prelude::*;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use strum::FromRepr;
use tokio_util::codec::{Decoder, Encoder};

use super::crc::{crc16, crc5, crc5_is_valid};
use crate::tracing::prelude::*;
use crate::work::Job;

/// Instantaneous hashrate register (value in MH/s, `0xffff_ffff` = no new
/// sample since the last read).
pub const REG_HASHRATE: u8 = 0x88;
/// Free-running total nonce counter, 4096 hashes per tick.
pub const REG_NONCE_TOTAL_CNT: u8 = 0x8c;
/// First per-domain nonce counter; domains occupy consecutive 4-byte
/// addresses above this.
pub const REG_DOMAIN_CNT_BASE: u8 = 0x90;
/// Hardware error counter, same tick unit as the nonce counters.
pub const REG_NONCE_ERR_CNT: u8 = 0xb0;

/// Most domains a chip can report through the counter address window.
pub const MAX_DOMAINS: u8 = 8;

/// Hashrate-related registers a chip can report, as a closed set.
///
/// Every dispatch site matches exhaustively; an address outside the known
/// window decodes to `Invalid` and is ignored by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashReg {
    /// Instantaneous rate register (direct value-to-rate conversion).
    RateGhs,
    /// Monotonic total-nonce counter.
    TotalCounter,
    /// Monotonic per-domain nonce counter.
    DomainCounter(u8),
    /// Monotonic hardware-error counter.
    ErrorCounter,
    /// Reply for a register the monitor does not track.
    Invalid,
}

impl HashReg {
    pub fn from_address(addr: u8) -> Self {
        match addr {
            REG_HASHRATE => Self::RateGhs,
            REG_NONCE_TOTAL_CNT => Self::TotalCounter,
            REG_NONCE_ERR_CNT => Self::ErrorCounter,
            a if a >= REG_DOMAIN_CNT_BASE
                && a < REG_DOMAIN_CNT_BASE + 4 * MAX_DOMAINS
                && (a - REG_DOMAIN_CNT_BASE) % 4 == 0 =>
            {
                Self::DomainCounter((a - REG_DOMAIN_CNT_BASE) / 4)
            }
            _ => Self::Invalid,
        }
    }

    pub fn address(self) -> Option<u8> {
        match self {
            Self::RateGhs => Some(REG_HASHRATE),
            Self::TotalCounter => Some(REG_NONCE_TOTAL_CNT),
            Self::DomainCounter(d) if d < MAX_DOMAINS => {
                Some(REG_DOMAIN_CNT_BASE + 4 * d)
            }
            Self::ErrorCounter => Some(REG_NONCE_ERR_CNT),
            _ => None,
        }
    }
}

/// One parsed frame off the result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// A nonce that passed the chip's ticket mask.
    Nonce {
        /// Chip-local job id the nonce belongs to.
        job_id: u8,
        nonce: u32,
        /// Rolled upper version bits as reported by the chip (header bits
        /// 16–31). The result pipeline expands these against the job's
        /// version mask.
        version_bits: u16,
        /// Originating chip index, derived from the nonce's address bits.
        chip: u8,
    },
    /// Reply to a register read, routed to the hashrate monitor.
    RegisterReply {
        chip: u8,
        register: HashReg,
        value: u32,
    },
}

/// The chip's fixed 82-byte job payload, laid out as the chip expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFrame {
    pub job_id: u8,
    pub num_midstates: u8,
    pub starting_nonce: [u8; 4],
    pub nbits: [u8; 4],
    pub ntime: [u8; 4],
    pub merkle_root: [u8; 32],
    pub prev_block_hash: [u8; 32],
    pub version: [u8; 4],
}

impl JobFrame {
    /// Serialize a job for transmission under a chip-local id.
    ///
    /// The rolled version space is the chip's to explore; the frame carries
    /// the base version.
    pub fn from_job(job: &Job, job_id: u8) -> Self {
        Self {
            job_id,
            num_midstates: 0x01,
            starting_nonce: job.starting_nonce.to_le_bytes(),
            nbits: job.nbits.to_le_bytes(),
            ntime: job.ntime.to_le_bytes(),
            merkle_root: job.merkle_root,
            prev_block_hash: job.prev_block_hash,
            version: job.version.to_le_bytes(),
        }
    }
}

/// Host→chain commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Assign an address to the next unaddressed chip in the chain.
    SetChipAddress { address: u8 },
    /// Prepare the chain for address assignment.
    ChainInactive,
    /// Read a register from one chip or all chips.
    ReadRegister { all: bool, chip: u8, register: u8 },
    /// Write a 4-byte register value to one chip or all chips.
    WriteRegister {
        all: bool,
        chip: u8,
        register: u8,
        data: [u8; 4],
    },
    /// Send a mining job.
    Job(JobFrame),
}

#[repr(u8)]
enum FlagsType {
    Job = 1,
    Command = 2,
}

#[repr(u8)]
enum FlagsCmd {
    SetChipAddress = 0,
    WriteRegisterOrJob = 1,
    ReadRegister = 2,
    ChainInactive = 3,
}

fn build_flags(typ: FlagsType, all: bool, cmd: FlagsCmd) -> u8 {
    let mut flags = 0u8;
    let field = flags.view_bits_mut::<Lsb0>();
    field[5..7].store(typ as u8);
    field[4..5].store(all as u8);
    field[0..4].store(cmd as u8);
    flags
}

impl Command {
    fn encode_body(&self, dst: &mut BytesMut) {
        // Length byte counts everything after the preamble, itself included.
        match self {
            Command::SetChipAddress { address } => {
                dst.put_u8(build_flags(
                    FlagsType::Command,
                    false,
                    FlagsCmd::SetChipAddress,
                ));
                dst.put_u8(5);
                dst.put_u8(*address);
                dst.put_u8(0x00);
            }
            Command::ChainInactive => {
                dst.put_u8(build_flags(
                    FlagsType::Command,
                    true,
                    FlagsCmd::ChainInactive,
                ));
                dst.put_u8(5);
                dst.put_u8(0x00);
                dst.put_u8(0x00);
            }
            Command::ReadRegister {
                all,
                chip,
                register,
            } => {
                dst.put_u8(build_flags(FlagsType::Command, *all, FlagsCmd::ReadRegister));
                dst.put_u8(5);
                dst.put_u8(*chip);
                dst.put_u8(*register);
            }
            Command::WriteRegister {
                all,
                chip,
                register,
                data,
            } => {
                dst.put_u8(build_flags(
                    FlagsType::Command,
                    *all,
                    FlagsCmd::WriteRegisterOrJob,
                ));
                dst.put_u8(9);
                dst.put_u8(*chip);
                dst.put_u8(*register);
                dst.put_slice(data);
            }
            Command::Job(frame) => {
                dst.put_u8(build_flags(
                    FlagsType::Job,
                    false,
                    FlagsCmd::WriteRegisterOrJob,
                ));
                // flags + length + 82-byte payload + crc16
                dst.put_u8(86);
                dst.put_u8(frame.job_id);
                dst.put_u8(frame.num_midstates);
                dst.put_slice(&frame.starting_nonce);
                dst.put_slice(&frame.nbits);
                dst.put_slice(&frame.ntime);
                dst.put_slice(&frame.merkle_root);
                dst.put_slice(&frame.prev_block_hash);
                dst.put_slice(&frame.version);
            }
        }
    }
}

/// Encoder half: commands out.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        const PREAMBLE: [u8; 2] = [0x55, 0xaa];
        dst.put_slice(&PREAMBLE);

        let start = dst.len();
        command.encode_body(dst);

        match command {
            Command::Job(_) => {
                let crc = crc16(&dst[start..]);
                dst.put_u16_le(crc);
            }
            _ => {
                let crc = crc5(&dst[start..]);
                dst.put_u8(crc);
            }
        }

        trace!("TX {} bytes: {:02x?}", dst.len() - start + 2, &dst[start - 2..]);
        Ok(())
    }
}

#[derive(FromRepr)]
#[repr(u8)]
enum ResponseType {
    RegisterReply = 0,
    Nonce = 4,
}

/// Decoder half: results in.
///
/// All result frames are 11 bytes: `AA 55` preamble plus 9 data bytes, the
/// last carrying the response type in its top 3 bits and the CRC-5 in the
/// bottom 5. Nonce frames hold nonce, job id and rolled version bits;
/// register frames hold value, chip address and register address.
#[derive(Debug)]
pub struct ResultCodec {
    /// Chain length. Bus addresses (register replies) and nonce address
    /// bits both translate to chip indices through the same `256 / chips`
    /// stride the chain was addressed with.
    chips: u8,
    dropped: u64,
}

impl Default for ResultCodec {
    fn default() -> Self {
        Self {
            chips: 1,
            dropped: 0,
        }
    }
}

impl ResultCodec {
    /// Frames skipped because of CRC failure or an unknown response type.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Fix the address stride once the chain length is known.
    pub fn set_chip_count(&mut self, chips: u8) {
        self.chips = chips.max(1);
    }

    /// Map a bus address (or the top byte of a nonce) to a chip index.
    /// The clamp covers the tail of the last chip's window when 256 does
    /// not divide evenly by the chain length.
    fn chip_index(&self, address: u8) -> u8 {
        if self.chips < 2 {
            return 0;
        }
        let interval = 256 / self.chips as u16;
        ((address as u16 / interval) as u8).min(self.chips - 1)
    }
}

impl Decoder for ResultCodec {
    type Item = TaskResult;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Returning Err would terminate the stream, so malformed input is
        // consumed a byte at a time until a valid frame aligns.
        const PREAMBLE: [u8; 2] = [0xaa, 0x55];
        const FRAME_LEN: usize = PREAMBLE.len() + 9;
        const CALL_AGAIN: Result<Option<TaskResult>, io::Error> = Ok(None);

        loop {
            if src.len() < FRAME_LEN {
                return CALL_AGAIN;
            }

            if src[0] != PREAMBLE[0] || src[1] != PREAMBLE[1] {
                src.advance(1);
                continue;
            }

            if !crc5_is_valid(&src[2..FRAME_LEN]) {
                trace!("result frame failed CRC, resyncing");
                self.dropped += 1;
                src.advance(1);
                continue;
            }

            let mut frame = src.split_to(FRAME_LEN);
            frame.advance(2);

            let type_repr = frame[frame.len() - 1].view_bits::<Lsb0>()[5..].load::<u8>();
            match ResponseType::from_repr(type_repr) {
                Some(ResponseType::Nonce) => {
                    let nonce = frame.get_u32_le();
                    let job_id = frame.get_u8();
                    let version_bits = frame.get_u16_le();
                    return Ok(Some(TaskResult::Nonce {
                        job_id,
                        nonce,
                        version_bits,
                        chip: self.chip_index((nonce >> 24) as u8),
                    }));
                }
                Some(ResponseType::RegisterReply) => {
                    let value = frame.get_u32_le();
                    let chip = self.chip_index(frame.get_u8());
                    let register = HashReg::from_address(frame.get_u8());
                    return Ok(Some(TaskResult::RegisterReply {
                        chip,
                        register,
                        value,
                    }));
                }
                None => {
                    trace!(type_repr, "unrecognized result frame type");
                    self.dropped += 1;
                    // The CRC was fine, so skip the whole frame.
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a sealed 11-byte result frame: payload is the 8 data bytes,
    /// the final byte packs the type bits and a CRC-5 that validates over
    /// the whole 9-byte tail.
    pub fn seal_frame(payload: [u8; 8], type_repr: u8) -> [u8; 11] {
        let mut frame = [0u8; 11];
        frame[0] = 0xaa;
        frame[1] = 0x55;
        frame[2..10].copy_from_slice(&payload);
        for crc in 0..32u8 {
            frame[10] = (type_repr << 5) | crc;
            if crc5_is_valid(&frame[2..11]) {
                return frame;
            }
        }
        unreachable!("a 5-bit CRC always exists");
    }

    pub fn nonce_frame(job_id: u8, nonce: u32, version_bits: u16) -> [u8; 11] {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&nonce.to_le_bytes());
        payload[4] = job_id;
        payload[5..7].copy_from_slice(&version_bits.to_le_bytes());
        seal_frame(payload, ResponseType::Nonce as u8)
    }

    pub fn register_frame(chip: u8, register: u8, value: u32) -> [u8; 11] {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&value.to_le_bytes());
        payload[4] = chip;
        payload[5] = register;
        seal_frame(payload, ResponseType::RegisterReply as u8)
    }
}
