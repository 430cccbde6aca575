//! This module contains the background tasks for the cache: the cleaner that
//! writes back dirty entries and shrinks the clock off the caller's thread.

pub(crate) mod cleaner;
