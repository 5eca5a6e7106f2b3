//! Circuit definition and public input layout.

mod domain_proof;
pub mod layout;

pub use domain_proof::{CircuitInputs, DomainMembershipCircuit};
pub use layout::{key_to_limbs, LayoutError, PublicInputs, NULLIFIER_INDEX, PUBLIC_INPUT_COUNT};
