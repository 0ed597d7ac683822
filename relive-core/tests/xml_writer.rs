use relive_core::danmaku::{ChatLogWriter, DanmakuStyle};

async fn written(messages: &[(f64, &str)]) -> String {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.xml.part");
    let mut writer = ChatLogWriter::create(&path).await.unwrap();
    for (offset, text) in messages {
        writer.write(*offset, text).await.unwrap();
    }
    writer.close().await.unwrap();
    tokio::fs::read_to_string(&path).await.unwrap()
}

fn is_balanced(document: &str) -> bool {
    document.matches("<d ").count() == document.matches("</d>").count()
}

#[tokio::test]
async fn document_opens_and_closes_the_root() {
    let doc = written(&[(0.5, "first"), (62.31, "second")]).await;
    assert!(doc.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<i>\n"));
    assert!(doc.ends_with("</i>\n"));
    assert!(is_balanced(&doc));
}

#[tokio::test]
async fn empty_log_is_still_well_formed() {
    let doc = written(&[]).await;
    assert!(doc.contains("<i>"));
    assert!(doc.ends_with("</i>\n"));
    assert_eq!(doc.matches("<d ").count(), 0);
}

#[tokio::test]
async fn offsets_carry_millisecond_precision() {
    let doc = written(&[(75.1234, "late message")]).await;
    assert!(doc.contains("<d p=\"75.123,1,25,16777215,"), "doc was: {doc}");
}

#[tokio::test]
async fn reserved_characters_are_escaped_in_text() {
    let doc = written(&[(1.0, "a<b & \"c\" > 'd'")]).await;
    assert!(doc.contains("a&lt;b &amp; &quot;c&quot; &gt; &apos;d&apos;"));
    assert!(!doc.contains("a<b"));
}

#[tokio::test]
async fn each_message_is_one_complete_line() {
    let doc = written(&[(1.0, "one"), (2.0, "two"), (3.0, "three")]).await;
    let elements: Vec<&str> = doc
        .lines()
        .filter(|line| line.starts_with("<d "))
        .collect();
    assert_eq!(elements.len(), 3);
    for element in elements {
        assert!(element.ends_with("</d>"));
    }
}

#[tokio::test]
async fn truncation_at_an_element_boundary_stays_recoverable() {
    let doc = written(&[(1.0, "one"), (2.0, "two"), (3.0, "three")]).await;
    // Simulate a crash: drop the closer and the last element, then close the
    // root by hand the way the recovery path does.
    let without_closer = doc.strip_suffix("</i>\n").unwrap();
    let cut = without_closer
        .lines()
        .take(without_closer.lines().count() - 1)
        .collect::<Vec<_>>()
        .join("\n");
    let recovered = format!("{cut}\n</i>\n");
    assert!(is_balanced(&recovered));
    assert!(recovered.ends_with("</i>\n"));
    assert_eq!(recovered.matches("<d ").count(), 2);
}

#[tokio::test]
async fn styled_writes_use_the_given_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.xml.part");
    let mut writer = ChatLogWriter::create(&path).await.unwrap();
    let style = DanmakuStyle {
        mode: 4,
        size: 36,
        color: 0xFF0000,
        pool: 1,
        user: "operator".to_string(),
        row_id: 7,
    };
    writer.write_styled(12.0, "置顶", &style).await.unwrap();
    writer.close().await.unwrap();

    let doc = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(doc.contains("<d p=\"12.000,4,36,16711680,"));
    assert!(doc.contains(",1,operator,7\">置顶</d>"));
}
