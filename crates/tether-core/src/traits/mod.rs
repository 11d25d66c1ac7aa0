//! Core trait definitions

mod interactor;

pub use interactor::SessionInteractor;
