use std::io;

// The handshake packets are negotiated by the surrounding peer protocol
// and never travel inside encrypted frames themselves. Their sizes are
// fixed: a compressed secp256k1 key plus, for encinit, one cipher byte.

pub struct EncInit {
    bytes: [u8; Self::SIZE],
}

impl EncInit {
    pub const SIZE: usize = 33 + 1;

    pub fn new(public_key: [u8; 33], cipher: u8) -> Self {
        let mut packet = EncInit {
            bytes: [0; Self::SIZE],
        };
        packet.bytes[..33].copy_from_slice(&public_key);
        packet.bytes[33] = cipher;
        packet
    }

    pub fn read<R: io::Read>(source: &mut R) -> Result<Self, io::Error> {
        let mut bytes = [0; Self::SIZE];
        source.read_exact(&mut bytes)?;
        Ok(EncInit { bytes: bytes })
    }

    pub fn write<W: io::Write>(&self, destination: &mut W) -> Result<(), io::Error> {
        destination.write_all(&self.bytes[..])
    }

    pub fn public_key(&self) -> [u8; 33] {
        let mut key = [0; 33];
        key.copy_from_slice(&self.bytes[..33]);
        key
    }

    pub fn cipher(&self) -> u8 {
        self.bytes[33]
    }
}

pub struct EncAck {
    bytes: [u8; Self::SIZE],
}

impl EncAck {
    pub const SIZE: usize = 33;

    pub fn new(public_key: [u8; 33]) -> Self {
        EncAck { bytes: public_key }
    }

    /// The all-zero key is reserved as the re-key signal.
    pub fn rekey() -> Self {
        EncAck {
            bytes: [0; Self::SIZE],
        }
    }

    pub fn read<R: io::Read>(source: &mut R) -> Result<Self, io::Error> {
        let mut bytes = [0; Self::SIZE];
        source.read_exact(&mut bytes)?;
        Ok(EncAck { bytes: bytes })
    }

    pub fn write<W: io::Write>(&self, destination: &mut W) -> Result<(), io::Error> {
        destination.write_all(&self.bytes[..])
    }

    pub fn public_key(&self) -> [u8; 33] {
        self.bytes
    }

    pub fn is_rekey(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }
}
