// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 constants used by policy sessions

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    GetCapability = 0x0000017A,
    PcrRead = 0x0000017E,
    StartAuthSession = 0x00000176,
    PolicyPcr = 0x0000017F,
    PolicyGetDigest = 0x00000189,
    FlushContext = 0x00000165,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Well-known TPM 2.0 response codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x00000000;
    pub const VALUE: u32 = 0x00000084;
    pub const HANDLE: u32 = 0x0000008B;
    pub const SESSION_HANDLES: u32 = 0x00000905;
    pub const POLICY_FAIL: u32 = 0x0000099D;
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Sm3_256 = 0x0012,
    Aes = 0x0006,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0012 => Some(TpmAlgId::Sm3_256),
            0x0006 => Some(TpmAlgId::Aes),
            _ => None,
        }
    }

    /// Parse a hash algorithm by name (`sha256`) or numeric id (`0x000b`, `11`)
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "sha1" => return Some(TpmAlgId::Sha1),
            "sha256" => return Some(TpmAlgId::Sha256),
            "sha384" => return Some(TpmAlgId::Sha384),
            "sha512" => return Some(TpmAlgId::Sha512),
            "sm3_256" | "sm3-256" | "sm3" => return Some(TpmAlgId::Sm3_256),
            _ => {}
        }
        let id = match lower.strip_prefix("0x") {
            Some(hex) => u16::from_str_radix(hex, 16).ok()?,
            None => lower.parse().ok()?,
        };
        Self::from_u16(id)
    }

    /// Digest length in bytes, `None` for non-hash algorithms
    pub fn digest_size(self) -> Option<usize> {
        match self {
            TpmAlgId::Sha1 => Some(20),
            TpmAlgId::Sha256 => Some(32),
            TpmAlgId::Sha384 => Some(48),
            TpmAlgId::Sha512 => Some(64),
            TpmAlgId::Sm3_256 => Some(32),
            _ => None,
        }
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    /// Handle type of a raw handle value
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const NULL: u32 = 0x40000007;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    TpmProperties = 0x00000006,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 property tags (TPM_PT)
pub mod tpm_pt {
    const PT_FIXED: u32 = 0x00000100;

    /// Number of PCRs implemented
    pub const PCR_COUNT: u32 = PT_FIXED + 18;
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alg_from_name() {
        assert_eq!(TpmAlgId::from_name("SHA256"), Some(TpmAlgId::Sha256));
        assert_eq!(TpmAlgId::from_name("0x000b"), Some(TpmAlgId::Sha256));
        assert_eq!(TpmAlgId::from_name("4"), Some(TpmAlgId::Sha1));
        assert_eq!(TpmAlgId::from_name("sm3_256"), Some(TpmAlgId::Sm3_256));
        assert_eq!(TpmAlgId::from_name("md5"), None);
        assert_eq!(TpmAlgId::from_name("0xffff"), None);
    }

    #[test]
    fn test_digest_sizes() {
        assert_eq!(TpmAlgId::Sha1.digest_size(), Some(20));
        assert_eq!(TpmAlgId::Sm3_256.digest_size(), Some(32));
        assert_eq!(TpmAlgId::Sha512.digest_size(), Some(64));
        assert_eq!(TpmAlgId::Aes.digest_size(), None);
    }

    #[test]
    fn test_handle_type() {
        assert_eq!(TpmHt::of(0x03000000), Some(TpmHt::PolicySession));
        assert_eq!(TpmHt::of(0x02000001), Some(TpmHt::HmacSession));
        assert_eq!(TpmHt::of(tpm_rh::NULL), Some(TpmHt::Permanent));
    }
}
