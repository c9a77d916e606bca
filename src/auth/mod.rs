//! Client identity, key provisioning, and challenge-response authentication.

mod authenticator;
mod deployer;
mod keys;

pub use authenticator::{
    AttestationProvider, AuthOutcome, Authenticator, AuthenticatorConfig, NoAttestation,
};
pub use deployer::{KeyDeployer, KeyDeploymentState, KeyPaths};
pub use keys::{fingerprint_of, KeyStore};
