#![no_main]

use enclave_core::{AuthenticatedCipher, CipherError, EncryptedBlob};
use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;
use std::sync::Arc;

static CIPHER: Lazy<Arc<AuthenticatedCipher>> = Lazy::new(|| {
    let cipher = Arc::new(AuthenticatedCipher::new());
    cipher.set_key(&[0x5a; 32]).unwrap();
    cipher
});

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(blob) = EncryptedBlob::from_document(doc) else {
        return;
    };

    // Anything that parses must either fail authentication or re-render
    // to a document that parses back to the same blob.
    match CIPHER.decrypt(&blob) {
        Ok(_) | Err(CipherError::Decryption) => {}
        Err(e) => panic!("unexpected error for parsed blob: {}", e),
    }
    let again = EncryptedBlob::from_document(&blob.to_document()).unwrap();
    assert_eq!(again, blob);
});
