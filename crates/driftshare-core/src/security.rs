// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::{Arc, Once};

use anyhow::Context;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::NodeError;

const NONCE_LEN: usize = 12;

/// Long-lived cryptographic state of one node process: the Ed25519
/// signing keypair advertised in PeerIdentity, and the self-signed TLS
/// material for mutually authenticated channels.
///
/// Trust model is first-contact-accept: the TLS layer admits any
/// self-signed peer certificate, and authenticity comes from the signed
/// hello exchanged inside the channel plus key pinning afterwards.
pub struct SecurityContext {
    signing_key: SigningKey,
    tls_cert_der: Vec<u8>,
    tls_key_der: Vec<u8>,
}

impl SecurityContext {
    pub fn generate() -> anyhow::Result<Self> {
        let mut rng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut rng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider();
        let cert = rcgen::generate_simple_self_signed(vec!["driftshare.local".to_string()])?;
        Ok(Self {
            signing_key,
            tls_cert_der: cert.cert.der().to_vec(),
            tls_key_der: cert.key_pair.serialize_der(),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, bytes: &[u8]) -> [u8; 64] {
        self.signing_key.sign(bytes).to_bytes()
    }

    pub fn verify(bytes: &[u8], signature: &[u8], public_key: &[u8; 32]) -> anyhow::Result<()> {
        if signature.len() != 64 {
            anyhow::bail!(NodeError::permission("signature must be 64 bytes"));
        }
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(signature);
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|err| NodeError::permission(format!("bad public key: {err}")))?;
        key.verify(bytes, &Signature::from_bytes(&sig_arr))
            .map_err(|err| NodeError::permission(format!("signature rejected: {err}")))?;
        Ok(())
    }

    /// Authenticated encryption with a fresh random nonce prefixed to the
    /// ciphertext. `open` is the only way back; there is no unauthenticated
    /// decrypt.
    pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| NodeError::integrity("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Rejects any ciphertext whose tag does not verify; truncated or
    /// tampered input never yields partial plaintext.
    pub fn open(key: &[u8; 32], sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            anyhow::bail!(NodeError::integrity("sealed payload shorter than nonce"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| NodeError::integrity("authentication tag rejected").into())
    }

    /// Symmetric key for a relay-hosted blob, derivable by anyone holding
    /// the owner's advertised public key and the upload id, which is
    /// exactly the set of peers a RelayFileRef was handed to.
    pub fn relay_blob_key(owner_public_key: &[u8; 32], upload_id: &str) -> [u8; 32] {
        let mut ikm = Vec::with_capacity(32 + upload_id.len());
        ikm.extend_from_slice(owner_public_key);
        ikm.extend_from_slice(upload_id.as_bytes());
        blake3::derive_key("driftshare relay blob key v1", &ikm)
    }

    /// Per-session chunk key from the channel handshake's X25519 exchange.
    pub fn session_chunk_key(
        dh_shared: &[u8; 32],
        initiator_nonce: &[u8; 32],
        responder_nonce: &[u8; 32],
    ) -> [u8; 32] {
        let mut ikm = Vec::with_capacity(96);
        ikm.extend_from_slice(dh_shared);
        ikm.extend_from_slice(initiator_nonce);
        ikm.extend_from_slice(responder_nonce);
        blake3::derive_key("driftshare session chunk key v1", &ikm)
    }

    pub fn tls_acceptor(&self) -> anyhow::Result<TlsAcceptor> {
        let cert_chain = vec![CertificateDer::from(self.tls_cert_der.clone())];
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.tls_key_der.clone()).clone_key());
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .context("build tls server config")?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub fn tls_connector() -> anyhow::Result<TlsConnector> {
        ensure_rustls_crypto_provider();
        let provider = rustls::crypto::CryptoProvider::get_default()
            .ok_or_else(|| anyhow::anyhow!("rustls crypto provider not installed"))?
            .clone();
        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FirstContactVerifier { provider }))
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(client_config)))
    }

    pub fn tls_server_name() -> anyhow::Result<ServerName<'static>> {
        ServerName::try_from("driftshare.local".to_string()).context("invalid tls server name")
    }
}

/// Accepts any presented certificate. Channel authenticity is established
/// by the signed hello and key pinning, not by the certificate chain.
#[derive(Debug)]
struct FirstContactVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for FirstContactVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}
