mod lifecycle;
mod model;

pub use lifecycle::{Action, ActionKind, Guard, Lifecycle, RoleActions};
pub use model::{
    Address, AddressError, Agreement, AgreementState, Amount, AmountInput, NewAgreement, Party,
    Role,
};
