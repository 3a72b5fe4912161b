mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;

use common::TestServer;
use netlink_core::TransferProgress;
use netlink_core::transfer::NoProgress;

#[tokio::test]
async fn test_batch_arrives_in_order() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let paths = vec![
        common::write_random_file(src.path(), "A.bin", 30_000)?,
        common::write_random_file(src.path(), "B.bin", 1)?,
        common::write_random_file(src.path(), "C.bin", 70_000)?,
    ];
    let mut server = TestServer::start(dst.path()).await?;

    let report = server.client().send_multiple_files(&paths, &NoProgress).await?;
    assert_eq!(report.files, ["A.bin", "B.bin", "C.bin"]);
    assert_eq!(report.bytes_sent, 100_001);

    for (expected, source) in ["A.bin", "B.bin", "C.bin"].iter().zip(&paths) {
        let (name, path) = server.next_received().await?;
        assert_eq!(&name, expected);
        assert_eq!(std::fs::read(path)?, std::fs::read(source)?);
    }

    server.handle.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_batch_progress_tracks_totals() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let paths = vec![
        common::write_random_file(src.path(), "one.bin", 10_000)?,
        common::write_random_file(src.path(), "two.bin", 20_000)?,
    ];
    let server = TestServer::start(dst.path()).await?;

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let reporter = move |p: &TransferProgress| {
        sink.lock().unwrap().push(p.clone());
    };
    server.client().send_multiple_files(&paths, &reporter).await?;

    let samples = samples.lock().unwrap();
    let last = samples.last().expect("progress was reported");
    assert!(last.is_sending);
    assert_eq!(last.file_name, "two.bin");
    assert_eq!(last.sent, 20_000);
    assert_eq!(last.total_sent, 30_000);
    assert_eq!(last.total_size, 30_000);

    // Per-file counter restarts while the running total keeps growing
    let first_of_two = samples.iter().find(|p| p.file_name == "two.bin").unwrap();
    assert!(first_of_two.sent <= first_of_two.total_sent - 10_000);
    assert!(samples.windows(2).all(|w| w[0].total_sent <= w[1].total_sent));

    drop(samples);
    server.handle.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_directory_keeps_structure() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let album = src.path().join("album");
    common::write_random_file(&album, "cover.jpg", 4_000)?;
    common::write_random_file(&album, "raw/img_001.cr2", 9_000)?;
    common::write_random_file(&album, "raw/img_002.cr2", 9_500)?;
    let mut server = TestServer::start(dst.path()).await?;

    let report = server.client().send_directory(&album, &NoProgress).await?;
    assert_eq!(
        report.files,
        ["album/cover.jpg", "album/raw/img_001.cr2", "album/raw/img_002.cr2"]
    );

    for _ in 0..3 {
        server.next_received().await?;
    }
    for name in ["cover.jpg", "raw/img_001.cr2", "raw/img_002.cr2"] {
        assert_eq!(
            std::fs::read(dst.path().join("album").join(name))?,
            std::fs::read(album.join(name))?
        );
    }

    server.handle.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_send_paths_dispatch() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let single = common::write_random_file(src.path(), "single.bin", 5_000)?;
    let loose = common::write_random_file(src.path(), "loose.txt", 100)?;
    let docs = src.path().join("docs");
    common::write_random_file(&docs, "a.md", 200)?;
    let mut server = TestServer::start(dst.path()).await?;
    let client = server.client();

    // One file goes through the resumable protocol
    let report = client.send_paths(&[single.clone()], &NoProgress).await?;
    assert_eq!(report.files, ["single.bin"]);
    server.next_received().await?;

    // Mixed selection is flattened into one batch
    let report = client.send_paths(&[loose, docs], &NoProgress).await?;
    assert_eq!(report.files, ["loose.txt", "docs/a.md"]);
    server.next_received().await?;
    server.next_received().await?;
    assert!(dst.path().join("docs").join("a.md").exists());

    server.handle.stop().await;
    Ok(())
}
