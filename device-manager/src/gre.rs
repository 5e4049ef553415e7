// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! `IFLA_GRE_*` link-info payload encoding.
//!
//! rtnetlink carries GRE link-info as opaque bytes, so the nested attributes
//! are encoded here. Attribute headers are native-endian; the key and flag
//! payloads are big-endian, matching what the kernel expects in the GRE
//! header itself.

use net::TunnelKey;
use std::net::Ipv4Addr;

const IFLA_GRE_IFLAGS: u16 = 2;
const IFLA_GRE_OFLAGS: u16 = 3;
const IFLA_GRE_IKEY: u16 = 4;
const IFLA_GRE_OKEY: u16 = 5;
const IFLA_GRE_LOCAL: u16 = 6;
const IFLA_GRE_REMOTE: u16 = 7;
const IFLA_GRE_PMTUDISC: u16 = 10;

/// GRE header flag signalling a keyed tunnel.
const GRE_KEY: u16 = 0x2000;

fn push_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    #[allow(clippy::cast_possible_truncation)] // payloads here are at most 4 bytes
    let len = (4 + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn push_keys(buf: &mut Vec<u8>, key: TunnelKey) {
    push_attr(buf, IFLA_GRE_IKEY, &key.as_u32().to_be_bytes());
    push_attr(buf, IFLA_GRE_IFLAGS, &GRE_KEY.to_be_bytes());
    push_attr(buf, IFLA_GRE_OKEY, &key.as_u32().to_be_bytes());
    push_attr(buf, IFLA_GRE_OFLAGS, &GRE_KEY.to_be_bytes());
}

/// Info-data for a keyed point-to-point gretap device.
pub(crate) fn gretap_info_data(local: Ipv4Addr, remote: Ipv4Addr, key: TunnelKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_attr(&mut buf, IFLA_GRE_LOCAL, &local.octets());
    push_attr(&mut buf, IFLA_GRE_REMOTE, &remote.octets());
    push_keys(&mut buf, key);
    push_attr(&mut buf, IFLA_GRE_PMTUDISC, &[1]);
    buf
}

/// Info-data for the keyed point-to-multipoint gre device (no remote).
pub(crate) fn gretun_info_data(local: Ipv4Addr, key: TunnelKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(48);
    push_attr(&mut buf, IFLA_GRE_LOCAL, &local.octets());
    push_keys(&mut buf, key);
    push_attr(&mut buf, IFLA_GRE_PMTUDISC, &[1]);
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attrs_are_four_byte_aligned() {
        let key = TunnelKey::new_checked(42).unwrap();
        let data = gretap_info_data(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 5),
            key,
        );
        assert_eq!(data.len() % 4, 0);
        let data = gretun_info_data(Ipv4Addr::new(10, 0, 0, 1), key);
        assert_eq!(data.len() % 4, 0);
    }

    #[test]
    fn local_attribute_layout() {
        let key = TunnelKey::new_checked(1).unwrap();
        let data = gretun_info_data(Ipv4Addr::new(192, 168, 1, 2), key);
        // len=8, type=IFLA_GRE_LOCAL, then the four octets
        assert_eq!(&data[0..2], &8u16.to_ne_bytes());
        assert_eq!(&data[2..4], &IFLA_GRE_LOCAL.to_ne_bytes());
        assert_eq!(&data[4..8], &[192, 168, 1, 2]);
    }

    #[test]
    fn keys_are_big_endian_and_flagged() {
        let key = TunnelKey::new_checked(0x0102_0304).unwrap();
        let data = gretun_info_data(Ipv4Addr::UNSPECIFIED, key);
        // skip the local attr (8 bytes); ikey attr follows
        assert_eq!(&data[8..10], &8u16.to_ne_bytes());
        assert_eq!(&data[10..12], &IFLA_GRE_IKEY.to_ne_bytes());
        assert_eq!(&data[12..16], &[1, 2, 3, 4]);
        // iflags attr: 2-byte payload padded to 4
        assert_eq!(&data[16..18], &6u16.to_ne_bytes());
        assert_eq!(&data[18..20], &IFLA_GRE_IFLAGS.to_ne_bytes());
        assert_eq!(&data[20..22], &[0x20, 0x00]);
        assert_eq!(&data[22..24], &[0, 0]);
    }
}
