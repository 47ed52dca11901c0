//! End-to-end tests of the FlashPro client against a companion server on a
//! local TCP socket. The tests live in `tests/`.
