use story_dispatch::AppError;

#[test]
fn display_prefixes_kind() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("locked".into()), "db: locked"),
        (AppError::Catalog("no dir".into()), "catalog: no dir"),
        (AppError::Launch("spawn".into()), "launch: spawn"),
        (AppError::LaunchTimeout("30s".into()), "launch timeout: 30s"),
        (AppError::CorruptRecord("x".into()), "corrupt record: x"),
        (AppError::NotFound("s1".into()), "not found: s1"),
        (AppError::Conflict("busy".into()), "conflict: busy"),
        (AppError::InvalidTransition("t".into()), "invalid transition: t"),
        (AppError::Io("eof".into()), "io: eof"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= broken")
        .expect_err("invalid toml")
        .into();
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn io_errors_become_io_errors() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, AppError::Io(_)), "got {err}");
}
