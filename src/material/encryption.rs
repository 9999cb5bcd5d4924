//! Page aligned encryption of serialized materials, using the cipher of the store they describe.
//!
//! The bytes are cut into blocks of one page less the bytes reserved by the codec, and every block
//! is encoded as the page of the same 1-based number. The first block gives up its leading bytes
//! to the cipher salt, stored in the clear, exactly as page 1 of an encrypted database does.

use log::debug;

use crate::{
    cipher::{CIPHER_SALT_SIZE, CipherDelegate},
    error::{Error, Result},
    pager::{decode_page, encode_page},
};

pub(crate) fn encrypt(plain: &[u8], cipher: &dyn CipherDelegate) -> Result<Vec<u8>> {
    let page_size = cipher.cipher_page_size() as usize;
    let codec = cipher.cipher_context();
    let salt = cipher.cipher_salt();
    let usable = page_size
        .checked_sub(codec.reserve())
        .filter(|usable| *usable > CIPHER_SALT_SIZE)
        .ok_or_else(|| Error::Misuse(format!("cipher page size {page_size} is too small")))?;

    let mut stored = Vec::new();
    stored.try_reserve(plain.len().div_ceil(usable - CIPHER_SALT_SIZE) * page_size)?;

    let mut rest = plain;
    let mut page_no = 1;
    loop {
        let start = if page_no == 1 { CIPHER_SALT_SIZE } else { 0 };
        let len = (usable - start).min(rest.len());

        let mut block = vec![0u8; page_size];
        block[start..start + len].copy_from_slice(&rest[..len]);
        rest = &rest[len..];

        encode_page(codec.as_ref(), page_no, &salt, &mut block)
            .map_err(|e| Error::Misuse(format!("unable to encrypt material: {e:#}")))?;
        stored.extend_from_slice(&block);

        if rest.is_empty() {
            break;
        }
        page_no += 1;
    }

    debug!("encrypted {} bytes into {page_no} pages", plain.len());
    Ok(stored)
}

/// Decrypt bytes produced by [`encrypt`], switching `cipher` to the salt they were produced
/// with. The result may carry trailing padding.
pub(crate) fn decrypt(stored: &[u8], cipher: &dyn CipherDelegate) -> Result<Vec<u8>> {
    let page_size = cipher.cipher_page_size() as usize;
    if page_size <= CIPHER_SALT_SIZE || stored.is_empty() || stored.len() % page_size != 0 {
        return Err(Error::corrupt("Cipher"));
    }

    let mut salt = [0u8; CIPHER_SALT_SIZE];
    salt.copy_from_slice(&stored[..CIPHER_SALT_SIZE]);
    cipher
        .switch_cipher_salt(&salt)
        .map_err(|e| Error::Misuse(format!("unable to switch cipher salt: {e:#}")))?;

    let codec = cipher.cipher_context();
    let usable = page_size
        .checked_sub(codec.reserve())
        .filter(|usable| *usable > CIPHER_SALT_SIZE)
        .ok_or_else(|| Error::corrupt("Cipher"))?;

    let mut plain = Vec::new();
    plain.try_reserve(stored.len())?;

    for (i, block) in stored.chunks_exact(page_size).enumerate() {
        let page_no = i as u32 + 1;
        let mut block = block.to_vec();
        decode_page(codec.as_ref(), page_no, &mut block).map_err(|_| Error::corrupt("Cipher"))?;

        let start = if page_no == 1 { CIPHER_SALT_SIZE } else { 0 };
        plain.extend_from_slice(&block[start..usable]);
    }

    Ok(plain)
}
