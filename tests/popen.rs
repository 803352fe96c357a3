//! End-to-end tests for the streaming Popen handle.

use pipework::{DataReader, DataWriter, Popen};
use std::io::{Read, Write};

#[test]
fn reader_streams_stdout() {
    let mut child = Popen::reader([["echo", "hi"]]).unwrap();
    let mut text = String::new();
    child.read_to_string(&mut text).unwrap();
    assert_eq!(text, "hi\n");
    child.wait().unwrap();
}

#[test]
fn reader_with_memory_stdin() {
    let mut child = Popen::reader_with_stdin(
        [["sort", "-r"]],
        DataWriter::new("one\ntwo\nthree\n").unwrap(),
    )
    .unwrap();
    let mut text = String::new();
    child.read_to_string(&mut text).unwrap();
    assert_eq!(text, "two\nthree\none\n");
    child.wait().unwrap();
}

#[test]
fn writer_streams_stdin() {
    let out = DataReader::new();
    let mut child = Popen::writer_with_stdout([["sort", "-r"]], &out).unwrap();
    child.write_all(b"one\ntwo\nthree\n").unwrap();
    child.wait().unwrap();
    assert_eq!(out.data(), "two\nthree\none\n");
}

#[test]
fn multi_stage_reader() {
    let mut child = Popen::reader_with_stdin(
        [vec!["cat"], vec!["tr", "a-z", "A-Z"]],
        DataWriter::new("hello\n").unwrap(),
    )
    .unwrap();
    let mut text = String::new();
    child.read_to_string(&mut text).unwrap();
    assert_eq!(text, "HELLO\n");
    child.wait().unwrap();
}

#[test]
fn wrong_direction_io_rejected() {
    let mut reader = Popen::reader([["true"]]).unwrap();
    let err = reader.write_all(b"nope").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    reader.wait().unwrap();

    let mut writer = Popen::writer_with_stdout([["cat"]], "/dev/null").unwrap();
    let mut buf = [0u8; 4];
    let err = writer.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    writer.wait().unwrap();
}

#[test]
fn poll_is_unsupported() {
    let mut child = Popen::reader([["true"]]).unwrap();
    assert!(child.poll().is_err());
    child.wait().unwrap();
}

#[test]
fn failure_surfaces_from_wait() {
    let mut child = Popen::reader([["false"]]).unwrap();
    let mut text = String::new();
    child.read_to_string(&mut text).unwrap();
    let err = child.wait().unwrap_err();
    assert_eq!(err.to_string(), "process exited 1: false");
}

#[test]
fn close_is_wait() {
    let mut child = Popen::writer([["sh", "-c", "cat >/dev/null"]]).unwrap();
    child.write_all(b"data\n").unwrap();
    child.close().unwrap();
    child.close().unwrap();
}

#[test]
fn description_shows_the_held_end() {
    let child = Popen::reader([["echo", "hi"]]).unwrap();
    let desc = child.pipeline().to_string();
    assert!(desc.starts_with("echo hi >"), "{desc}");
}
