//! Background controllers: scale-to-zero idling and ingress reconciliation.

pub mod idle;
pub mod ingress;
