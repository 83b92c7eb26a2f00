//! Screen-share broadcast coordination for the campus client. One
//! instructor streams a captured display to any number of student
//! viewers over direct peer links; session negotiation travels through
//! a shared publish/subscribe signaling relay, never the media itself.

pub mod broadcast;
pub mod capture;
pub mod peer;
pub mod session;
pub mod signal;
pub mod viewer;
