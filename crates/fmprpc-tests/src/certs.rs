//! Throwaway certificates for TLS tests.

/// PEM material for a CA and one server certificate it signed.
#[derive(Debug, Clone)]
pub struct TestCerts {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Generates a fresh CA and a server certificate valid for `hosts`.
pub fn generate_test_certs(hosts: &[&str]) -> TestCerts {
    let ca_key = rcgen::KeyPair::generate().expect("generate CA key");
    let mut ca_params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("CA params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "fmprpc test CA");
    let ca = ca_params.self_signed(&ca_key).expect("self-sign CA");

    let key = rcgen::KeyPair::generate().expect("generate server key");
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let params = rcgen::CertificateParams::new(names).expect("server params");
    let cert = params.signed_by(&key, &ca, &ca_key).expect("sign server cert");

    TestCerts {
        ca_pem: ca.pem().into_bytes(),
        cert_pem: cert.pem().into_bytes(),
        key_pem: key.serialize_pem().into_bytes(),
    }
}
