use bytes::BytesMut;
use ring::{aead, hkdf};

use super::{CryptoError, HeaderKey, KeyPair, Keys, PacketKey};
use crate::{packet::LONG_HEADER_FORM, shared::ConnectionId, Side};

/// Salt used to derive Initial secrets in QUIC version 1
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

const KEY_LEN: usize = 16;
const IV_LEN: usize = 12;

/// Construct the keys protecting Initial packets
///
/// Both peers derive the same keys from the destination connection ID chosen by the client.
pub fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys {
    let (client, server) = initial_secrets(dst_cid);
    keys_from_secrets(side, &client, &server)
}

fn initial_secrets(dst_cid: &ConnectionId) -> (Vec<u8>, Vec<u8>) {
    let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(dst_cid);
    (
        expand_label(&initial, b"client in", &[], 32),
        expand_label(&initial, b"server in", &[], 32),
    )
}

/// Build a key set from the client and server traffic secrets of an encryption level
pub(crate) fn keys_from_secrets(side: Side, client: &[u8], server: &[u8]) -> Keys {
    let (local, remote) = match side {
        Side::Client => (Material::new(client), Material::new(server)),
        Side::Server => (Material::new(server), Material::new(client)),
    };
    Keys {
        header: KeyPair {
            local: Box::new(local.header_key()),
            remote: Box::new(remote.header_key()),
        },
        packet: KeyPair {
            local: Box::new(local.packet_key()),
            remote: Box::new(remote.packet_key()),
        },
    }
}

/// HKDF-Expand-Label as defined for TLS 1.3
pub(crate) fn expand_label(prk: &hkdf::Prk, label: &[u8], context: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    expand_label_into(prk, label, context, &mut out);
    out
}

fn expand_label_into(prk: &hkdf::Prk, label: &[u8], context: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let context_len = [context.len() as u8];
    let info = [
        &out_len[..],
        &label_len[..],
        PREFIX,
        label,
        &context_len[..],
        context,
    ];
    prk.expand(&info, Len(out.len()))
        .and_then(|okm| okm.fill(out))
        .expect("HKDF output length is bounded");
}

struct Len(usize);

impl hkdf::KeyType for Len {
    fn len(&self) -> usize {
        self.0
    }
}

/// Packet protection material derived from one traffic secret
struct Material {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    hp: [u8; KEY_LEN],
}

impl Material {
    fn new(secret: &[u8]) -> Self {
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
        let mut material = Self {
            key: [0; KEY_LEN],
            iv: [0; IV_LEN],
            hp: [0; KEY_LEN],
        };
        expand_label_into(&prk, b"quic key", &[], &mut material.key);
        expand_label_into(&prk, b"quic iv", &[], &mut material.iv);
        expand_label_into(&prk, b"quic hp", &[], &mut material.hp);
        material
    }

    fn header_key(&self) -> aead::quic::HeaderProtectionKey {
        aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &self.hp)
            .expect("AES-128 key length")
    }

    fn packet_key(&self) -> AeadKey {
        let key = aead::UnboundKey::new(&aead::AES_128_GCM, &self.key).expect("AES-128 key length");
        AeadKey {
            key: aead::LessSafeKey::new(key),
            iv: self.iv,
        }
    }
}

/// AES-128-GCM payload protection
struct AeadKey {
    key: aead::LessSafeKey,
    iv: [u8; IV_LEN],
}

impl AeadKey {
    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (n, p) in nonce[IV_LEN - 8..].iter_mut().zip(packet.to_be_bytes()) {
            *n ^= p;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl PacketKey for AeadKey {
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, rest) = buf.split_at_mut(header_len);
        let tag_start = rest.len() - self.tag_len();
        let (payload, tag_out) = rest.split_at_mut(tag_start);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet), aead::Aad::from(&*header), payload)
            .expect("payload within AEAD limits");
        tag_out.copy_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain_len = self
            .key
            .open_in_place(self.nonce(packet), aead::Aad::from(header), payload.as_mut())
            .map_err(|_| CryptoError)?
            .len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl HeaderKey for aead::quic::HeaderProtectionKey {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        apply_mask(self, pn_offset, packet, true);
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        apply_mask(self, pn_offset, packet, false);
    }

    fn sample_size(&self) -> usize {
        self.algorithm().sample_len()
    }
}

/// XOR the header protection mask into the first byte and the packet number
///
/// The packet number length is read from the first byte before masking when protecting, and
/// after unmasking when removing protection.
fn apply_mask(
    key: &aead::quic::HeaderProtectionKey,
    pn_offset: usize,
    packet: &mut [u8],
    unmask: bool,
) {
    let sample_start = pn_offset + 4;
    let sample_end = sample_start + key.algorithm().sample_len();
    let mask = key
        .new_mask(&packet[sample_start..sample_end])
        .expect("sample has the algorithm's length");
    let bits = if packet[0] & LONG_HEADER_FORM != 0 {
        0x0f
    } else {
        0x1f
    };
    let first = if unmask {
        packet[0] ^ (mask[0] & bits)
    } else {
        packet[0]
    };
    let pn_len = (first & 0x03) as usize + 1;
    packet[0] ^= mask[0] & bits;
    for (byte, m) in packet[pn_offset..pn_offset + pn_len]
        .iter_mut()
        .zip(&mask[1..])
    {
        *byte ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 9001 appendix A.1
    const DCID: [u8; 8] = hex!("8394c8f03e515708");

    #[test]
    fn initial_secrets_rfc9001() {
        let (client, server) = initial_secrets(&ConnectionId::new(&DCID));
        assert_eq!(
            client[..],
            hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")[..]
        );
        assert_eq!(
            server[..],
            hex!("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b")[..]
        );

        let client = Material::new(&client);
        assert_eq!(client.key, hex!("1f369613dd76d5467730efcbe3b1a22d"));
        assert_eq!(client.iv, hex!("fa044b2f42a3fd3b46fb255c"));
        assert_eq!(client.hp, hex!("9f50449e04a0e810283a1e9933adedd2"));

        let server = Material::new(&server);
        assert_eq!(server.key, hex!("cf3a5331653c364c88f0f379b6067e37"));
        assert_eq!(server.iv, hex!("0ac1493ca1905853b0bba03e"));
        assert_eq!(server.hp, hex!("c206b8d9b9f0f37644430b490eeaa314"));
    }

    #[test]
    fn header_mask_rfc9001() {
        let hp = Material::new(&initial_secrets(&ConnectionId::new(&DCID)).0).header_key();
        let mask = hp.new_mask(&hex!("d1b1c98dd7689fb8ec11d242b123dc9b")).unwrap();
        assert_eq!(mask, hex!("437b9aec36"));
    }

    #[test]
    fn packet_protection_roundtrip() {
        let cid = ConnectionId::new(&DCID);
        let client = initial_keys(&cid, Side::Client);
        let server = initial_keys(&cid, Side::Server);

        let header = [0xc3u8, 0, 0, 0, 1];
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"handshake payload");
        buf.resize(buf.len() + client.packet.local.tag_len(), 0);
        client.packet.local.encrypt(7, &mut buf, header.len());
        assert_ne!(&buf[header.len()..header.len() + 17], b"handshake payload");

        let mut payload = BytesMut::from(&buf[header.len()..]);
        server
            .packet
            .remote
            .decrypt(7, &header, &mut payload)
            .unwrap();
        assert_eq!(&payload[..], b"handshake payload");

        // Wrong packet number fails authentication
        let mut payload = BytesMut::from(&buf[header.len()..]);
        assert_eq!(
            server.packet.remote.decrypt(8, &header, &mut payload),
            Err(CryptoError)
        );
    }
}
