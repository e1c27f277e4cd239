pub mod account;
pub mod external_login;
pub mod role;

pub use account::{CreateAccount, IdentityAccount, UpdateAccount, normalize_key};
pub use external_login::{ExternalIdentity, ExternalLoginLink, FederatedAccount};
pub use role::IdentityRole;
