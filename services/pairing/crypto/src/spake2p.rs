//! SPAKE2+ over P-256 (RFC 9383 M/N points, SHA-256, HKDF, HMAC).
//!
//! The commissioner is the prover and holds `w0, w1` derived from the
//! passcode. The device is the verifier and holds only `w0 || L` where
//! `L = w1·G`, so a stolen verifier does not reveal the passcode.
//!
//! ```text
//! prover                                   verifier
//!   X = x·G + w0·M       ---- X ---->
//!                                          Y = y·G + w0·N
//!                                          Z = y·(X - w0·M), V = y·L
//!                        <--- Y, cB --
//!   Z = x·(Y - w0·N)
//!   V = w1·(Y - w0·N)
//!                        ---- cA ---->
//! ```

use crate::kdf::{hkdf_sha256, hmac_sha256, pbkdf2_sha256, sha256};
use crate::{constant_time_eq, CryptoError, Result, GROUP_SIZE, HASH_LEN, PUBLIC_KEY_LEN};
use once_cell::sync::Lazy;
use p256::elliptic_curve::group::Group;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::PrimeField;
use p256::{AffinePoint, EncodedPoint, FieldBytes, NonZeroScalar, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use std::fmt;
use tracing::trace;
use zeroize::Zeroizing;

/// Width of each PBKDF2 output half before reduction mod n
pub const W_SIZE: usize = GROUP_SIZE + 8;

/// Serialized verifier length (`w0 || L`)
pub const VERIFIER_LEN: usize = GROUP_SIZE + PUBLIC_KEY_LEN;

/// Half of the hashed transcript used for confirmation and session keys
pub const KEY_LEN: usize = HASH_LEN / 2;

/// Smallest accepted PBKDF2 iteration count
pub const PBKDF_MIN_ITERATIONS: u32 = 1000;

/// Largest accepted PBKDF2 iteration count
pub const PBKDF_MAX_ITERATIONS: u32 = 100_000;

/// Largest representable setup passcode
pub const MAX_PASSCODE: u32 = 99_999_998;

const INVALID_PASSCODES: [u32; 12] = [
    0, 11_111_111, 22_222_222, 33_333_333, 44_444_444, 55_555_555, 66_666_666, 77_777_777,
    88_888_888, 99_999_999, 12_345_678, 87_654_321,
];

const M_COMPRESSED: [u8; 33] = [
    0x02, 0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79,
    0xf2, 0x99, 0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d,
    0x8f, 0xa1, 0x2f,
];

const N_COMPRESSED: [u8; 33] = [
    0x03, 0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3,
    0x77, 0x07, 0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1,
    0x29, 0x2b, 0x49,
];

static POINT_M: Lazy<Result<ProjectivePoint>> = Lazy::new(|| decode_point(&M_COMPRESSED));
static POINT_N: Lazy<Result<ProjectivePoint>> = Lazy::new(|| decode_point(&N_COMPRESSED));

/// Check a setup passcode against the allowed range and the trivial values
pub fn validate_passcode(passcode: u32) -> Result<()> {
    if passcode == 0 || passcode > MAX_PASSCODE || INVALID_PASSCODES.contains(&passcode) {
        return Err(CryptoError::InvalidPasscode);
    }
    Ok(())
}

/// Prover-side secrets `w0, w1`
#[derive(Clone)]
pub struct PasscodeSecrets {
    w0: Scalar,
    w1: Scalar,
}

impl fmt::Debug for PasscodeSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasscodeSecrets(..)")
    }
}

impl PasscodeSecrets {
    /// Derive `w0, w1` from the passcode with PBKDF2-HMAC-SHA256
    pub fn derive(passcode: u32, salt: &[u8], iterations: u32) -> Result<Self> {
        validate_passcode(passcode)?;
        let ws = pbkdf2_sha256(&passcode.to_le_bytes(), salt, iterations, 2 * W_SIZE);
        Ok(Self {
            w0: reduce(&ws[..W_SIZE]),
            w1: reduce(&ws[W_SIZE..]),
        })
    }

    /// Verifier the device stores instead of the passcode
    pub fn verifier(&self) -> PasscodeVerifier {
        PasscodeVerifier {
            w0: self.w0,
            l: ProjectivePoint::GENERATOR * self.w1,
        }
    }
}

/// Verifier-side record `w0 || L`
#[derive(Clone)]
pub struct PasscodeVerifier {
    w0: Scalar,
    l: ProjectivePoint,
}

impl fmt::Debug for PasscodeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasscodeVerifier(..)")
    }
}

impl PasscodeVerifier {
    /// Derive the verifier directly from a passcode
    pub fn derive(passcode: u32, salt: &[u8], iterations: u32) -> Result<Self> {
        Ok(PasscodeSecrets::derive(passcode, salt, iterations)?.verifier())
    }

    /// Serialize as `w0 (32) || L (65, uncompressed)`
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(VERIFIER_LEN));
        out.extend_from_slice(&self.w0.to_repr());
        out.extend_from_slice(&encode_point(&self.l)?);
        Ok(out)
    }

    /// Parse the serialized form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != VERIFIER_LEN {
            return Err(CryptoError::InvalidLength {
                expected: VERIFIER_LEN,
                actual: bytes.len(),
            });
        }
        let w0 = Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(
            &bytes[..GROUP_SIZE],
        )))
        .ok_or(CryptoError::InvalidPoint("w0 out of range"))?;
        let l = decode_point(&bytes[GROUP_SIZE..])?;
        Ok(Self { w0, l })
    }
}

/// Prover (commissioner) side of one exchange
pub struct Spake2pProver {
    context: [u8; HASH_LEN],
    secrets: PasscodeSecrets,
    x: NonZeroScalar,
    share: [u8; PUBLIC_KEY_LEN],
}

impl Spake2pProver {
    /// Pick a random `x` and compute `X`
    pub fn new(context: [u8; HASH_LEN], secrets: &PasscodeSecrets) -> Result<Self> {
        let x = NonZeroScalar::random(&mut OsRng);
        let point = ProjectivePoint::GENERATOR * *x + point_m()? * secrets.w0;
        Ok(Self {
            context,
            secrets: secrets.clone(),
            x,
            share: encode_point(&point)?,
        })
    }

    /// Public share `X`
    pub fn share(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.share
    }

    /// Consume the verifier share `Y` and derive the exchange keys
    pub fn finish(self, peer_share: &[u8]) -> Result<Spake2pKeys> {
        let y = decode_point(peer_share)?;
        let t = y - point_n()? * self.secrets.w0;
        let z = t * *self.x;
        let v = t * self.secrets.w1;
        Spake2pKeys::derive(
            &self.context,
            &self.share,
            &encode_point(&y)?,
            &z,
            &v,
            &self.secrets.w0,
        )
    }
}

/// Verifier (device) side of one exchange
pub struct Spake2pVerifier {
    context: [u8; HASH_LEN],
    verifier: PasscodeVerifier,
    y: NonZeroScalar,
    share: [u8; PUBLIC_KEY_LEN],
}

impl Spake2pVerifier {
    /// Pick a random `y` and compute `Y`
    pub fn new(context: [u8; HASH_LEN], verifier: &PasscodeVerifier) -> Result<Self> {
        let y = NonZeroScalar::random(&mut OsRng);
        let point = ProjectivePoint::GENERATOR * *y + point_n()? * verifier.w0;
        Ok(Self {
            context,
            verifier: verifier.clone(),
            y,
            share: encode_point(&point)?,
        })
    }

    /// Public share `Y`
    pub fn share(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.share
    }

    /// Consume the prover share `X` and derive the exchange keys
    pub fn finish(self, peer_share: &[u8]) -> Result<Spake2pKeys> {
        let x = decode_point(peer_share)?;
        let t = x - point_m()? * self.verifier.w0;
        let z = t * *self.y;
        let v = self.verifier.l * *self.y;
        Spake2pKeys::derive(
            &self.context,
            &encode_point(&x)?,
            &self.share,
            &z,
            &v,
            &self.verifier.w0,
        )
    }
}

/// Keys agreed by one SPAKE2+ exchange
pub struct Spake2pKeys {
    ke: Zeroizing<[u8; KEY_LEN]>,
    kc_a: Zeroizing<[u8; KEY_LEN]>,
    kc_b: Zeroizing<[u8; KEY_LEN]>,
    x: [u8; PUBLIC_KEY_LEN],
    y: [u8; PUBLIC_KEY_LEN],
}

impl Spake2pKeys {
    fn derive(
        context: &[u8],
        x: &[u8; PUBLIC_KEY_LEN],
        y: &[u8; PUBLIC_KEY_LEN],
        z: &ProjectivePoint,
        v: &ProjectivePoint,
        w0: &Scalar,
    ) -> Result<Self> {
        let m = encode_point(&point_m()?)?;
        let n = encode_point(&point_n()?)?;
        let z = encode_point(z)?;
        let v = encode_point(v)?;
        let mut w0_bytes = Zeroizing::new([0u8; GROUP_SIZE]);
        w0_bytes.copy_from_slice(&w0.to_repr());

        // Prover and verifier identities are empty
        let items: [&[u8]; 10] = [context, &[], &[], &m, &n, x, y, &z, &v, &w0_bytes[..]];
        let mut tt = Zeroizing::new(Vec::with_capacity(512));
        for item in items {
            tt.extend_from_slice(&(item.len() as u64).to_le_bytes());
            tt.extend_from_slice(item);
        }
        trace!("spake2p transcript {} bytes", tt.len());

        let hash = Zeroizing::new(sha256(&[&tt]));
        let kc = hkdf_sha256(&hash[..KEY_LEN], &[], b"ConfirmationKeys", 2 * KEY_LEN)?;

        let mut keys = Self {
            ke: Zeroizing::new([0u8; KEY_LEN]),
            kc_a: Zeroizing::new([0u8; KEY_LEN]),
            kc_b: Zeroizing::new([0u8; KEY_LEN]),
            x: *x,
            y: *y,
        };
        keys.ke.copy_from_slice(&hash[KEY_LEN..]);
        keys.kc_a.copy_from_slice(&kc[..KEY_LEN]);
        keys.kc_b.copy_from_slice(&kc[KEY_LEN..]);
        Ok(keys)
    }

    /// Shared key material for session key derivation
    pub fn ke(&self) -> &[u8] {
        &self.ke[..]
    }

    /// Prover confirmation `cA = HMAC(KcA, Y)`
    pub fn prover_confirmation(&self) -> Result<[u8; HASH_LEN]> {
        hmac_sha256(&self.kc_a[..], &[&self.y])
    }

    /// Verifier confirmation `cB = HMAC(KcB, X)`
    pub fn verifier_confirmation(&self) -> Result<[u8; HASH_LEN]> {
        hmac_sha256(&self.kc_b[..], &[&self.x])
    }

    /// Check a received `cA` in constant time
    pub fn check_prover_confirmation(&self, received: &[u8]) -> Result<bool> {
        Ok(constant_time_eq(&self.prover_confirmation()?, received))
    }

    /// Check a received `cB` in constant time
    pub fn check_verifier_confirmation(&self, received: &[u8]) -> Result<bool> {
        Ok(constant_time_eq(&self.verifier_confirmation()?, received))
    }
}

fn point_m() -> Result<ProjectivePoint> {
    POINT_M.clone()
}

fn point_n() -> Result<ProjectivePoint> {
    POINT_N.clone()
}

/// Interpret big-endian bytes as an integer reduced mod the group order
fn reduce(bytes: &[u8]) -> Scalar {
    let radix = Scalar::from(256u64);
    bytes
        .iter()
        .fold(Scalar::ZERO, |acc, b| acc * radix + Scalar::from(*b as u64))
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|_| CryptoError::InvalidPublicKey("malformed SEC1 encoding".into()))?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or_else(|| CryptoError::InvalidPublicKey("point not on curve".into()))
}

fn encode_point(point: &ProjectivePoint) -> Result<[u8; PUBLIC_KEY_LEN]> {
    if bool::from(point.is_identity()) {
        return Err(CryptoError::InvalidPoint("identity"));
    }
    let encoded = point.to_affine().to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(encoded.as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"SPAKE2P Key Salt";
    const ITERATIONS: u32 = 1000;

    fn exchange(prover_pin: u32, device_pin: u32) -> (Spake2pKeys, Spake2pKeys) {
        let context = sha256(&[b"test context"]);
        let secrets = PasscodeSecrets::derive(prover_pin, SALT, ITERATIONS).unwrap();
        let verifier = PasscodeVerifier::derive(device_pin, SALT, ITERATIONS).unwrap();

        let prover = Spake2pProver::new(context, &secrets).unwrap();
        let device = Spake2pVerifier::new(context, &verifier).unwrap();
        let x = *prover.share();
        let y = *device.share();
        (prover.finish(&y).unwrap(), device.finish(&x).unwrap())
    }

    #[test]
    fn test_fixed_points_decode() {
        assert!(point_m().is_ok());
        assert!(point_n().is_ok());
    }

    #[test]
    fn test_matching_passcodes_agree() {
        let (prover, device) = exchange(20202021, 20202021);
        assert_eq!(prover.ke(), device.ke());
        assert!(prover
            .check_verifier_confirmation(&device.verifier_confirmation().unwrap())
            .unwrap());
        assert!(device
            .check_prover_confirmation(&prover.prover_confirmation().unwrap())
            .unwrap());
    }

    #[test]
    fn test_wrong_passcode_fails_confirmation() {
        let (prover, device) = exchange(20202021, 20202022);
        assert_ne!(prover.ke(), device.ke());
        assert!(!prover
            .check_verifier_confirmation(&device.verifier_confirmation().unwrap())
            .unwrap());
    }

    #[test]
    fn test_verifier_serialization() {
        let verifier = PasscodeVerifier::derive(20202021, SALT, ITERATIONS).unwrap();
        let bytes = verifier.to_bytes().unwrap();
        assert_eq!(bytes.len(), VERIFIER_LEN);
        let restored = PasscodeVerifier::from_bytes(&bytes).unwrap();
        assert_eq!(*restored.to_bytes().unwrap(), *bytes);
        assert!(PasscodeVerifier::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_passcode_policy() {
        assert!(validate_passcode(20202021).is_ok());
        assert!(validate_passcode(1).is_ok());
        for bad in [0, 11_111_111, 12_345_678, 87_654_321, 99_999_999, 100_000_000] {
            assert_eq!(validate_passcode(bad), Err(CryptoError::InvalidPasscode));
        }
    }

    #[test]
    fn test_reduce_matches_small_values() {
        assert_eq!(reduce(&[0x01, 0x00]), Scalar::from(256u64));
        assert_eq!(reduce(&[0u8; W_SIZE]), Scalar::ZERO);
    }

    #[test]
    fn test_rejects_invalid_share() {
        let context = sha256(&[b"ctx"]);
        let verifier = PasscodeVerifier::derive(20202021, SALT, ITERATIONS).unwrap();
        let device = Spake2pVerifier::new(context, &verifier).unwrap();
        assert!(device.finish(&[0x04; PUBLIC_KEY_LEN]).is_err());
    }
}
