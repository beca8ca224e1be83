//! Central identity and session management.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod users;

pub use principal::{guest_user, super_user, Principal};
pub use session::{Session, SessionAuthority};
pub use users::{MemoryUserStore, NewUser, User, UserId, UserStore};
