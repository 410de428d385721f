//! Integration tests exercising the S3 implementation of [`copyout::ObjectStorage`], and whole
//! copy jobs against real object storage.
//!
//! These use [minio](https://min.io), and the copy job tests also need `rclone`.  Both must be
//! installed locally, so the tests are marked `ignore` and must be explicitly invoked.

mod minio;
