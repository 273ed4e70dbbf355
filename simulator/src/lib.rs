/*++
Licensed under the Apache-2.0 license.

Abstract:
    Software module implementing the command subset used for key
    attestation. Keys are real; storage protection is not. Child private
    areas never leave the simulator and are handed out as opaque blob ids.
--*/

pub use channel::SimulatorChannel;

mod channel;
mod keys;

use hkdf::Hkdf;
use keys::KeyMaterial;
use log::debug;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tpm::{
    commands::{
        error_response, CertifyCreationCmd, CertifyCreationResp, Command, CreateCmd,
        CreatePrimaryCmd, CreatePrimaryResp, CreateResp, FlushContextCmd, FlushContextResp,
        LoadCmd, LoadResp, Response, SignCmd, SignResp,
    },
    rc,
    structures::{alg, handle, st, ClockInfo, PcrSelection},
    Attest, CreationData, ObjectAttributes, Public, PublicParams, SigScheme, TkCreation,
    TpmError, MAX_QUALIFYING_DATA_SIZE,
};

/// Transient object slots, as on a typical discrete module.
pub const MAX_OBJECTS: usize = 3;

/// Reported in every attestation.
pub const FIRMWARE_VERSION: u64 = 0x0001_0000_0000_0000;

const BLOB_ID_SIZE: usize = 32;

struct Object {
    public: Public,
    public_area: Vec<u8>,
    name: Vec<u8>,
    qualified_name: Vec<u8>,
    key: KeyMaterial,
    /// Blob the object was loaded from; primaries have none.
    blob: Option<Vec<u8>>,
}

/// A created child waiting to be loaded under the parent that made it.
struct Blob {
    parent_name: Vec<u8>,
    public_area: Vec<u8>,
    key: KeyMaterial,
}

pub struct Simulator {
    rng: StdRng,
    /// Owner hierarchy primary seed.
    seed: [u8; 32],
    /// Secret behind creation tickets.
    proof: [u8; 32],
    objects: BTreeMap<u32, Object>,
    blobs: HashMap<Vec<u8>, Blob>,
    next_handle: u32,
    clock: u64,
}

impl Default for Simulator {
    fn default() -> Self {
        Simulator::new()
    }
}

impl Simulator {
    pub fn new() -> Simulator {
        Simulator::with_rng(StdRng::from_entropy())
    }

    /// A simulator whose seeds and keys all derive from `seed`.
    pub fn from_seed(seed: u64) -> Simulator {
        Simulator::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Simulator {
        let mut seed = [0; 32];
        let mut proof = [0; 32];
        rng.fill_bytes(&mut seed);
        rng.fill_bytes(&mut proof);
        Simulator {
            rng,
            seed,
            proof,
            objects: BTreeMap::new(),
            blobs: HashMap::new(),
            next_handle: handle::TRANSIENT_FIRST,
            clock: 0,
        }
    }

    /// Executes one serialized command and returns the serialized response.
    /// Failures come back as a bare header carrying the response code.
    pub fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        let command = match Command::deserialize(command) {
            Ok(command) => command,
            Err(e) => {
                debug!("Rejected command: {e}");
                return error_response(response_code(&e));
            }
        };
        let sessions = command.sessions();
        let code = u32::from(&command);
        match self.dispatch(command) {
            Ok(response) => match response.serialize(sessions) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Command {code:#05x} response did not marshal: {e}");
                    error_response(response_code(&e))
                }
            },
            Err(rc) => {
                debug!("Command {code:#05x} failed with {rc:#05x}");
                error_response(rc)
            }
        }
    }

    pub fn loaded_objects(&self) -> usize {
        self.objects.len()
    }

    /// Created objects whose private area is still held.
    pub fn held_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Flushes every transient object, as a resource manager does when a
    /// client disconnects.
    pub fn flush_all(&mut self) {
        self.objects.clear();
        self.blobs.clear();
    }

    fn dispatch(&mut self, command: Command) -> Result<Response, u32> {
        Ok(match command {
            Command::CreatePrimary(cmd) => Response::CreatePrimary(self.create_primary(cmd)?),
            Command::Create(cmd) => Response::Create(self.create(cmd)?),
            Command::Load(cmd) => Response::Load(self.load(cmd)?),
            Command::CertifyCreation(cmd) => {
                Response::CertifyCreation(self.certify_creation(cmd)?)
            }
            Command::Sign(cmd) => Response::Sign(self.sign(cmd)?),
            Command::FlushContext(cmd) => Response::FlushContext(self.flush_context(cmd)?),
        })
    }

    /// Only storage primaries are supported. Their unique field is derived
    /// from the hierarchy seed and the template, so the same template always
    /// yields the same name.
    fn create_primary(&mut self, cmd: CreatePrimaryCmd) -> Result<CreatePrimaryResp, u32> {
        if cmd.primary_handle != handle::RH_OWNER {
            return Err(rc::HANDLE);
        }
        let mut public = cmd.in_public;
        if !is_storage_parent(&public) {
            return Err(rc::ATTRIBUTES);
        }
        let template = public.to_bytes().map_err(|e| response_code(&e))?;
        let PublicParams::Rsa {
            key_bits, modulus, ..
        } = &mut public.params
        else {
            return Err(rc::ATTRIBUTES);
        };
        let mut unique = vec![0; usize::from(*key_bits / 8)];
        Hkdf::<Sha256>::new(None, &self.seed)
            .expand(&template, &mut unique)
            .map_err(|_| rc::VALUE)?;
        *modulus = unique;

        let creation_data = CreationData {
            pcr_select: pcr_selection(cmd.creation_pcr)?,
            pcr_digest: vec![],
            locality: LOCALITY_ZERO,
            parent_name_alg: alg::NULL,
            parent_name: handle::RH_OWNER.to_be_bytes().to_vec(),
            parent_qualified_name: handle::RH_OWNER.to_be_bytes().to_vec(),
            outside_info: cmd.outside_info,
        };

        let name = public.name().map_err(|e| response_code(&e))?;
        let qualified_name = qualified_name(&public, &handle::RH_OWNER.to_be_bytes(), &name);
        let creation_data = creation_data.to_bytes().map_err(|e| response_code(&e))?;
        let creation_hash = public.name_alg.digest(&creation_data);
        let creation_ticket = self.creation_ticket(&name, &creation_hash);
        let public_area = public.to_bytes().map_err(|e| response_code(&e))?;
        let object_handle = self.insert(Object {
            public,
            public_area: public_area.clone(),
            name: name.clone(),
            qualified_name,
            key: KeyMaterial::Storage,
            blob: None,
        })?;

        Ok(CreatePrimaryResp {
            object_handle,
            out_public: public_area,
            creation_data,
            creation_hash,
            creation_ticket,
            name,
        })
    }

    fn create(&mut self, cmd: CreateCmd) -> Result<CreateResp, u32> {
        let parent = self.storage_parent(cmd.parent_handle)?;
        let (parent_name, parent_name_alg, parent_qualified_name) = (
            parent.name.clone(),
            parent.public.name_alg,
            parent.qualified_name.clone(),
        );

        let mut public = cmd.in_public;
        if !public.is_signing_key()
            || !public
                .attributes
                .contains(ObjectAttributes::SENSITIVE_DATA_ORIGIN)
            || !cmd.in_sensitive.data.is_empty()
        {
            return Err(rc::ATTRIBUTES);
        }
        if public.attributes.contains(ObjectAttributes::RESTRICTED) && public.scheme().is_none() {
            return Err(rc::SCHEME);
        }
        let key = KeyMaterial::generate(&mut public, &mut self.rng)?;

        let creation_data = CreationData {
            pcr_select: pcr_selection(cmd.creation_pcr)?,
            pcr_digest: vec![],
            locality: LOCALITY_ZERO,
            parent_name_alg: parent_name_alg.id(),
            parent_name: parent_name.clone(),
            parent_qualified_name,
            outside_info: cmd.outside_info,
        }
        .to_bytes()
        .map_err(|e| response_code(&e))?;
        let creation_hash = public.name_alg.digest(&creation_data);
        let name = public.name().map_err(|e| response_code(&e))?;
        let creation_ticket = self.creation_ticket(&name, &creation_hash);

        let public_area = public.to_bytes().map_err(|e| response_code(&e))?;
        let mut blob_id = vec![0; BLOB_ID_SIZE];
        self.rng.fill_bytes(&mut blob_id);
        self.blobs.insert(
            blob_id.clone(),
            Blob {
                parent_name,
                public_area: public_area.clone(),
                key,
            },
        );

        Ok(CreateResp {
            out_private: blob_id,
            out_public: public_area,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    fn load(&mut self, cmd: LoadCmd) -> Result<LoadResp, u32> {
        let parent = self.storage_parent(cmd.parent_handle)?;
        let parent_name = parent.name.clone();
        let parent_qualified_name = parent.qualified_name.clone();

        let blob = self.blobs.get(&cmd.in_private).ok_or(rc::INTEGRITY)?;
        if blob.parent_name != parent_name || blob.public_area != cmd.in_public {
            return Err(rc::INTEGRITY);
        }
        let public = Public::from_bytes(&cmd.in_public).map_err(|e| response_code(&e))?;
        let key = blob.key.clone();

        let name = public.name().map_err(|e| response_code(&e))?;
        let qualified_name = qualified_name(&public, &parent_qualified_name, &name);
        let object_handle = self.insert(Object {
            public,
            public_area: cmd.in_public,
            name: name.clone(),
            qualified_name,
            key,
            blob: Some(cmd.in_private),
        })?;
        Ok(LoadResp {
            object_handle,
            name,
        })
    }

    fn certify_creation(&mut self, cmd: CertifyCreationCmd) -> Result<CertifyCreationResp, u32> {
        let signer = self.objects.get(&cmd.sign_handle).ok_or(rc::HANDLE)?;
        let object = self.objects.get(&cmd.object_handle).ok_or(rc::HANDLE)?;
        if !signer.public.is_signing_key() {
            return Err(rc::KEY);
        }
        if cmd.qualifying_data.len() > MAX_QUALIFYING_DATA_SIZE {
            return Err(rc::SIZE);
        }
        let expected = self.creation_ticket(&object.name, &cmd.creation_hash);
        if cmd.creation_ticket != expected {
            return Err(rc::TICKET);
        }
        let scheme = resolve_scheme(signer.public.scheme(), cmd.in_scheme)?;

        let attest = Attest {
            qualified_signer: signer.qualified_name.clone(),
            extra_data: cmd.qualifying_data,
            clock_info: ClockInfo {
                clock: self.clock,
                reset_count: 0,
                restart_count: 0,
                safe: true,
            },
            firmware_version: FIRMWARE_VERSION,
            object_name: object.name.clone(),
            creation_hash: cmd.creation_hash,
        }
        .to_bytes()
        .map_err(|e| response_code(&e))?;
        let signature = signer.key.sign(scheme, &scheme.hash.digest(&attest))?;
        self.clock += 1;

        Ok(CertifyCreationResp {
            certify_info: attest,
            signature,
        })
    }

    /// Restricted keys only sign digests vouched for by a hash-check
    /// ticket, and this simulator never issues one.
    fn sign(&self, cmd: SignCmd) -> Result<SignResp, u32> {
        let key = self.objects.get(&cmd.key_handle).ok_or(rc::HANDLE)?;
        if !key.public.is_signing_key() {
            return Err(rc::KEY);
        }
        if key.public.attributes.contains(ObjectAttributes::RESTRICTED) {
            return Err(rc::TICKET);
        }
        let scheme = resolve_scheme(key.public.scheme(), cmd.in_scheme)?;
        Ok(SignResp {
            signature: key.key.sign(scheme, &cmd.digest)?,
        })
    }

    /// Flushing the last object loaded from a blob also drops the blob.
    fn flush_context(&mut self, cmd: FlushContextCmd) -> Result<FlushContextResp, u32> {
        let object = self.objects.remove(&cmd.flush_handle).ok_or(rc::HANDLE)?;
        if let Some(blob) = object.blob {
            if !self.objects.values().any(|o| o.blob.as_ref() == Some(&blob)) {
                self.blobs.remove(&blob);
            }
        }
        Ok(FlushContextResp)
    }

    fn storage_parent(&self, handle: u32) -> Result<&Object, u32> {
        let parent = self.objects.get(&handle).ok_or(rc::HANDLE)?;
        match parent.key {
            KeyMaterial::Storage => Ok(parent),
            _ => Err(rc::KEY),
        }
    }

    fn insert(&mut self, object: Object) -> Result<u32, u32> {
        if self.objects.len() >= MAX_OBJECTS {
            return Err(rc::OBJECT_MEMORY);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(handle::TRANSIENT_FIRST);
        debug!(
            "Loaded object {handle:#010x} ({} bytes public area)",
            object.public_area.len()
        );
        self.objects.insert(handle, object);
        Ok(handle)
    }

    /// `H(proof || TPM_ST_CREATION || name || creationHash)` in the owner
    /// hierarchy.
    fn creation_ticket(&self, name: &[u8], creation_hash: &[u8]) -> TkCreation {
        let digest = Sha256::new()
            .chain_update(self.proof)
            .chain_update(st::CREATION.to_be_bytes())
            .chain_update(name)
            .chain_update(creation_hash)
            .finalize();
        TkCreation {
            hierarchy: handle::RH_OWNER,
            digest: digest.to_vec(),
        }
    }
}

/// `TPMA_LOCALITY` with only locality zero set.
const LOCALITY_ZERO: u8 = 0x01;

fn is_storage_parent(public: &Public) -> bool {
    let attributes = public.attributes;
    attributes.contains(ObjectAttributes::RESTRICTED | ObjectAttributes::DECRYPT)
        && !attributes.contains(ObjectAttributes::SIGN_ENCRYPT)
        && matches!(
            public.params,
            PublicParams::Rsa {
                symmetric: Some(_),
                scheme: None,
                ..
            }
        )
}

/// There are no PCR banks, so only an empty selection is accepted.
fn pcr_selection(selection: Vec<PcrSelection>) -> Result<Vec<PcrSelection>, u32> {
    if selection.iter().any(|s| s.select.iter().any(|&b| b != 0)) {
        return Err(rc::VALUE);
    }
    Ok(selection)
}

fn qualified_name(public: &Public, parent_qualified_name: &[u8], name: &[u8]) -> Vec<u8> {
    let mut qualified = public.name_alg.id().to_be_bytes().to_vec();
    qualified.extend(public.name_alg.digest(&[parent_qualified_name, name].concat()));
    qualified
}

fn resolve_scheme(key: Option<SigScheme>, requested: Option<SigScheme>) -> Result<SigScheme, u32> {
    match (key, requested) {
        (Some(key), None) => Ok(key),
        (Some(key), Some(requested)) if key == requested => Ok(key),
        (None, Some(requested)) => Ok(requested),
        _ => Err(rc::SCHEME),
    }
}

/// Response code reported for a command that could not be parsed.
fn response_code(error: &TpmError) -> u32 {
    match error {
        TpmError::ResponseCode(code) => *code,
        TpmError::Malformed(_) | TpmError::Oversized(_) => rc::SIZE,
        TpmError::UnsupportedAlgorithm(_) => rc::VALUE,
        _ => rc::FAILURE,
    }
}
