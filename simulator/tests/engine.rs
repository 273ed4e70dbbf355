// Licensed under the Apache-2.0 license

use crypto::{key_authorization_digest, AccountKey, KeyKind};
use der::{Decode, Encode};
use p256::ecdsa::signature::Verifier;
use platform::{read_frame, Transport};
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use simulator::{Simulator, SimulatorChannel};
use std::cell::RefCell;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::rc::Rc;
use tpm::{
    engine::Module,
    x509::{build_csr, permanent_identifiers, synthesize_ak_certificate, PermanentIdentifier},
    AkAlgorithm, Algorithm, Attest, AttestationObject, CreationData, KeyConfig, Public,
    Signature, TpmError,
};
use x509_cert::{request::CertReq, Certificate};

fn open(seed: u64) -> (Module<SimulatorChannel>, Rc<RefCell<Simulator>>) {
    let sim = Rc::new(RefCell::new(Simulator::from_seed(seed)));
    let module = Module::open(SimulatorChannel::attach(sim.clone())).unwrap();
    (module, sim)
}

fn qualifying_data(token: &str) -> Vec<u8> {
    let account = AccountKey::generate(KeyKind::EcdsaP256).unwrap();
    key_authorization_digest(token, &account).to_vec()
}

fn config(algorithm: Algorithm, size: u16, qualifying_data: &[u8]) -> KeyConfig {
    KeyConfig {
        algorithm,
        size,
        qualifying_data: qualifying_data.to_vec(),
    }
}

fn verify_ecdsa_p256(public: &Public, message: &[u8], signature: &Signature) {
    let Signature::Ecdsa { r, s, .. } = signature else {
        panic!("expected an ECDSA signature");
    };
    let spki = public.subject_public_key_info().unwrap();
    let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(spki.subject_public_key.raw_bytes())
        .unwrap();
    let signature = p256::ecdsa::Signature::from_scalars(
        *p256::FieldBytes::from_slice(r),
        *p256::FieldBytes::from_slice(s),
    )
    .unwrap();
    key.verify(message, &signature).unwrap();
}

#[test]
fn test_certification_binds_qualifying_data() {
    let (mut module, sim) = open(1);
    let qd = qualifying_data("token-1");
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    let (_key, params) = module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &qd))
        .unwrap();

    let creation = CreationData::from_bytes(&params.create_data).unwrap();
    assert_eq!(creation.outside_info, qd);

    let attest = Attest::from_bytes(&params.create_attestation).unwrap();
    assert_eq!(attest.extra_data, qd);
    assert_eq!(
        attest.creation_hash,
        Sha256::digest(&params.create_data).to_vec()
    );
    assert_eq!(
        attest.object_name,
        Public::from_bytes(&params.public).unwrap().name().unwrap()
    );

    let signature = Signature::from_bytes(&params.create_signature).unwrap();
    verify_ecdsa_p256(ak.public(), &params.create_attestation, &signature);

    assert_eq!(sim.borrow().loaded_objects(), 3);
    module.close().unwrap();
    assert_eq!(sim.borrow().loaded_objects(), 0);
}

#[test]
fn test_rsa_attestation_key() {
    let (mut module, _sim) = open(2);
    let qd = qualifying_data("token-2");
    let ak = module.create_ak(AkAlgorithm::default()).unwrap();
    let (_key, params) = module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &qd))
        .unwrap();
    assert_eq!(params.scheme.cose_algorithm(), -257);

    let Signature::RsaSsa { sig, .. } = Signature::from_bytes(&params.create_signature).unwrap()
    else {
        panic!("expected an RSASSA signature");
    };
    let spki = ak.public().subject_public_key_info().unwrap();
    let key = RsaPublicKey::from_public_key_der(&spki.to_der().unwrap()).unwrap();
    key.verify(
        Pkcs1v15Sign::new::<Sha256>(),
        &Sha256::digest(&params.create_attestation),
        &sig,
    )
    .unwrap();
}

#[test]
fn test_second_certification_while_loaded_is_refused() {
    let (mut module, sim) = open(3);
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &[1; 32]))
        .unwrap();
    assert!(matches!(
        module.certify_key(&ak, &config(Algorithm::Ecdsa, 256, &[2; 32])),
        Err(TpmError::InvalidState(_))
    ));
    assert!(matches!(
        module.create_ak(AkAlgorithm::EccP256),
        Err(TpmError::InvalidState(_))
    ));
    assert_eq!(sim.borrow().loaded_objects(), 3);

    drop(module);
    assert_eq!(sim.borrow().loaded_objects(), 0);
}

#[test]
fn test_released_key_makes_room_for_the_next() {
    let (mut module, sim) = open(11);
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    let (first, _) = module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &[1; 32]))
        .unwrap();
    module.release_key(first).unwrap();
    assert_eq!(sim.borrow().loaded_objects(), 2);
    assert_eq!(sim.borrow().held_blobs(), 1);

    let (second, params) = module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 384, &[2; 32]))
        .unwrap();
    let attest = Attest::from_bytes(&params.create_attestation).unwrap();
    assert_eq!(attest.extra_data, [2; 32]);
    assert_eq!(sim.borrow().loaded_objects(), 3);

    let csr = build_csr(&mut module.signer(&second).unwrap(), "12345").unwrap();
    CertReq::from_der(&csr).unwrap();
    module.release_key(second).unwrap();
    assert!(matches!(
        module.certify_key(&ak, &config(Algorithm::Ecdsa, 512, &[3; 32])),
        Err(TpmError::UnsupportedAlgorithm(_))
    ));
    module.close().unwrap();
    assert_eq!(sim.borrow().loaded_objects(), 0);
}

#[test]
fn test_ak_certificate_names_device() {
    let (mut module, _sim) = open(4);
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    let der = synthesize_ak_certificate(&ak, "12345").unwrap();

    let cert = Certificate::from_der(&der).unwrap();
    assert!(cert.tbs_certificate.subject.0.is_empty());
    assert_eq!(
        cert.tbs_certificate.subject_public_key_info,
        ak.public().subject_public_key_info().unwrap()
    );
    let extensions = cert.tbs_certificate.extensions.unwrap();
    assert_eq!(
        permanent_identifiers(&extensions).unwrap(),
        [PermanentIdentifier::device("12345")]
    );

    let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
    let san = parsed.subject_alternative_name().unwrap().unwrap();
    assert!(san.critical);
    let x509_parser::extensions::GeneralName::OtherName(oid, _) = &san.value.general_names[0]
    else {
        panic!("expected an otherName");
    };
    assert_eq!(oid.to_id_string(), "1.3.6.1.5.5.7.8.3");
}

#[test]
fn test_csr_signed_through_module() {
    for (size, seed) in [(256, 5), (384, 6)] {
        let (mut module, _sim) = open(seed);
        let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
        let (key, _) = module
            .certify_key(&ak, &config(Algorithm::Ecdsa, size, &[7; 32]))
            .unwrap();
        let der = build_csr(&mut module.signer(&key).unwrap(), "device-1").unwrap();

        let csr = CertReq::from_der(&der).unwrap();
        let spki = key.public().subject_public_key_info().unwrap();
        assert_eq!(csr.info.public_key, spki);
        let info = csr.info.to_der().unwrap();
        let point = spki.subject_public_key.raw_bytes();
        let signature = csr.signature.raw_bytes();
        match size {
            256 => p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .unwrap()
                .verify(&info, &p256::ecdsa::Signature::from_der(signature).unwrap())
                .unwrap(),
            _ => p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .unwrap()
                .verify(&info, &p384::ecdsa::Signature::from_der(signature).unwrap())
                .unwrap(),
        }
    }
}

#[test]
fn test_rsa_key_csr() {
    let (mut module, _sim) = open(7);
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    let (key, _) = module
        .certify_key(&ak, &config(Algorithm::Rsa, 2048, &[]))
        .unwrap();
    let der = build_csr(&mut module.signer(&key).unwrap(), "device-2").unwrap();

    let csr = CertReq::from_der(&der).unwrap();
    let public = RsaPublicKey::from_public_key_der(&csr.info.public_key.to_der().unwrap()).unwrap();
    public
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(csr.info.to_der().unwrap()),
            csr.signature.raw_bytes(),
        )
        .unwrap();
}

#[test]
fn test_statement_from_module_output() {
    let (mut module, _sim) = open(8);
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    let (_key, params) = module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &qualifying_data("t")))
        .unwrap();
    let ak_cert = synthesize_ak_certificate(&ak, "12345").unwrap();

    let encoded = tpm::statement::encode(&ak_cert, &params).unwrap();
    let decoded = AttestationObject::decode(&encoded).unwrap();
    assert_eq!(decoded.algorithm, -7);
    assert_eq!(decoded.x5c, [ak_cert]);
    assert_eq!(decoded.pub_area, params.public);
    assert_eq!(decoded.cert_info, params.create_attestation);
    assert_eq!(decoded.signature, params.create_signature);
}

#[test]
fn test_module_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tpm-sim.socket");
    let listener = UnixListener::bind(&path).unwrap();
    let server = std::thread::spawn(move || {
        let mut sim = Simulator::from_seed(9);
        let (mut stream, _) = listener.accept().unwrap();
        while let Some(command) = read_frame(&mut stream).unwrap() {
            stream.write_all(&sim.execute(&command)).unwrap();
        }
        sim.loaded_objects()
    });

    let channel = platform::open(&Transport::Socket(path.clone())).unwrap();
    let mut module = Module::open(channel).unwrap();
    let ak = module.create_ak(AkAlgorithm::EccP256).unwrap();
    module
        .certify_key(&ak, &config(Algorithm::Ecdsa, 256, &[3; 32]))
        .unwrap();
    module.close().unwrap();

    assert_eq!(server.join().unwrap(), 0);
}
