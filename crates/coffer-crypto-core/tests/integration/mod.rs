mod container_roundtrip;
mod key_files;
