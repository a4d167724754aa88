pub mod identity;
pub mod threshold;

pub use identity::{IdentitySigner, PublicKeyBytes};
pub use threshold::{
    generate_shares, ThresholdAggregate, ThresholdPublicKey, ThresholdSecretShare,
    ThresholdSignatureShare, ThresholdSigner,
};
