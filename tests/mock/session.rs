use futures::Future;

use tokio_smtp_session::mock::ActionData::{Lines, Payload};
use tokio_smtp_session::mock::Actor::{Client, Server};
use tokio_smtp_session::{Event, Message, RecipientKind, SessionState};

use super::mock;

fn mail_to(recipient: &str) -> Message {
    let mut message = Message::new();
    message.set_sender("Sender <sender@me.test>");
    message.add_recipient(RecipientKind::To, recipient);
    message.set_subject("integration");
    message.set_body("over the public api\n");
    message
}

#[test]
fn queue_drains_in_enqueue_order() {
    let mut session = mock(vec![
        (Server, Lines(vec!["220 they.test ESMTP"])),
        (Client, Lines(vec!["EHLO me.test"])),
        (Server, Lines(vec!["250-they.test greets you", "250 PIPELINING"])),
        (
            Client,
            Lines(vec!["mail from:<sender@me.test>", "rcpt to:<one@they.test>"]),
        ),
        (Server, Lines(vec!["250 ok", "250 ok"])),
        (Client, Lines(vec!["data"])),
        (Server, Lines(vec!["354 go"])),
        (Client, Payload),
        (Server, Lines(vec!["250 queued"])),
        (Client, Lines(vec!["rset"])),
        (Server, Lines(vec!["250 ok"])),
        (
            Client,
            Lines(vec!["mail from:<sender@me.test>", "rcpt to:<two@they.test>"]),
        ),
        (Server, Lines(vec!["250 ok", "250 ok"])),
        (Client, Lines(vec!["data"])),
        (Server, Lines(vec!["354 go"])),
        (Client, Payload),
        (Server, Lines(vec!["250 queued"])),
    ]);

    let first = session.send(mail_to("one@they.test"));
    let second = session.send(mail_to("two@they.test"));
    assert!(first < second);

    let session = session.drive().wait().unwrap();
    assert_eq!(
        session.handler().events,
        vec![
            Event::Connected,
            Event::Authenticated,
            Event::MailSent(first),
            Event::MailSent(second),
            Event::Finished,
        ]
    );
    assert_eq!(session.state(), SessionState::Waiting);
}

#[test]
fn quit_after_the_queue_drained() {
    let session = mock(vec![
        (Server, Lines(vec!["220 they.test ESMTP"])),
        (Client, Lines(vec!["EHLO me.test"])),
        (Server, Lines(vec!["250 they.test greets you"])),
        (Client, Lines(vec!["QUIT"])),
    ]);

    let mut session = session.drive().wait().unwrap();
    assert_eq!(session.state(), SessionState::Waiting);

    session.quit();
    let session = session.drive().wait().unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(
        session.handler().events,
        vec![
            Event::Connected,
            Event::Authenticated,
            Event::Finished,
            Event::Disconnected,
        ]
    );
}

#[test]
fn extension_table_is_rebuilt_by_each_ehlo() {
    let session = mock(vec![
        (Server, Lines(vec!["220 they.test ESMTP"])),
        (Client, Lines(vec!["EHLO me.test"])),
        (
            Server,
            Lines(vec![
                "250-they.test greets you",
                "250-SIZE 35882577",
                "250-8BITMIME",
                "250 X-NOT-A-ROBOT enabled",
            ]),
        ),
    ]);

    let session = session.drive().wait().unwrap();
    assert!(session.has_extension("SIZE"));
    assert!(session.has_extension("8bitmime"));
    assert_eq!(session.extension_data("size"), Some("35882577"));
    assert_eq!(session.extension_data("X-NOT-A-ROBOT"), Some("enabled"));
    assert!(!session.has_extension("STARTTLS"));
}
