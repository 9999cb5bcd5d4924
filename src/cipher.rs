//! Boundary to the encryption layer. Key derivation and the cipher itself live outside this
//! crate, which only ever sees a [`PageCodec`] handed over by a [`CipherDelegate`].

use std::rc::Rc;

/// Length of the salt stored in the clear at the start of an encrypted file.
pub const CIPHER_SALT_SIZE: usize = 16;

/// Transforms whole pages in place between their stored and their plain form.
///
/// Blocks may be shorter than a page (the salt prefix of page 1 is never passed to the codec),
/// the last [`PageCodec::reserve`] bytes of each block belong to the codec.
pub trait PageCodec {
    /// Number of bytes at the end of every block the codec uses for its own bookkeeping.
    fn reserve(&self) -> usize;

    /// Decrypt the stored bytes of `page_no`.
    fn decode(&self, page_no: u32, block: &mut [u8]) -> anyhow::Result<()>;

    /// Encrypt the plain bytes of `page_no`.
    fn encode(&self, page_no: u32, block: &mut [u8]) -> anyhow::Result<()>;
}

/// Source of the cipher configuration for an encrypted store.
pub trait CipherDelegate {
    /// Page size the store was encrypted with. The stored header cannot be read without it.
    fn cipher_page_size(&self) -> u32;

    /// Codec for the currently active key and salt.
    fn cipher_context(&self) -> Rc<dyn PageCodec>;

    /// Salt currently in use.
    fn cipher_salt(&self) -> [u8; CIPHER_SALT_SIZE];

    /// Switch to the provided salt, so that [`CipherDelegate::cipher_context`] decodes content
    /// produced under it.
    fn switch_cipher_salt(&self, salt: &[u8; CIPHER_SALT_SIZE]) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::Cell;

    use anyhow::bail;

    use super::*;

    /// Reversible codec for tests, mixing the page number and salt into every byte and stamping
    /// a tag into the reserved tail so that decoding with the wrong salt is detected.
    pub struct XorCodec {
        pub salt: [u8; CIPHER_SALT_SIZE],
    }

    impl XorCodec {
        fn key(&self, page_no: u32, i: usize) -> u8 {
            self.salt[i % CIPHER_SALT_SIZE] ^ (page_no as u8) ^ (i as u8)
        }
    }

    impl PageCodec for XorCodec {
        fn reserve(&self) -> usize {
            4
        }

        fn decode(&self, page_no: u32, block: &mut [u8]) -> anyhow::Result<()> {
            let body = block.len() - self.reserve();
            if block[body..] != self.salt[..4] {
                bail!("tag mismatch on page {page_no}");
            }

            for (i, b) in block[..body].iter_mut().enumerate() {
                *b ^= self.key(page_no, i);
            }
            Ok(())
        }

        fn encode(&self, page_no: u32, block: &mut [u8]) -> anyhow::Result<()> {
            let body = block.len() - self.reserve();
            for (i, b) in block[..body].iter_mut().enumerate() {
                *b ^= self.key(page_no, i);
            }
            block[body..].copy_from_slice(&self.salt[..4]);
            Ok(())
        }
    }

    pub struct XorCipher {
        pub page_size: u32,
        pub salt: Cell<[u8; CIPHER_SALT_SIZE]>,
    }

    impl XorCipher {
        pub fn new(page_size: u32, salt: [u8; CIPHER_SALT_SIZE]) -> Self {
            Self {
                page_size,
                salt: Cell::new(salt),
            }
        }
    }

    impl CipherDelegate for XorCipher {
        fn cipher_page_size(&self) -> u32 {
            self.page_size
        }

        fn cipher_context(&self) -> Rc<dyn PageCodec> {
            Rc::new(XorCodec {
                salt: self.salt.get(),
            })
        }

        fn cipher_salt(&self) -> [u8; CIPHER_SALT_SIZE] {
            self.salt.get()
        }

        fn switch_cipher_salt(&self, salt: &[u8; CIPHER_SALT_SIZE]) -> anyhow::Result<()> {
            self.salt.set(*salt);
            Ok(())
        }
    }

    #[test]
    fn codec_round_trip() {
        let codec = XorCodec { salt: [9; 16] };
        let mut block = (0..64u8).collect::<Vec<_>>();
        let original = block.clone();

        codec.encode(3, &mut block).unwrap();
        assert_ne!(block[..60], original[..60]);

        codec.decode(3, &mut block).unwrap();
        assert_eq!(block[..60], original[..60]);
    }

    #[test]
    fn wrong_salt_is_rejected() {
        let mut block = vec![0u8; 32];
        XorCodec { salt: [1; 16] }.encode(1, &mut block).unwrap();

        assert!(XorCodec { salt: [2; 16] }.decode(1, &mut block).is_err());
    }
}
