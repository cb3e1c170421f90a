extern crate env_logger;
extern crate futures;
extern crate rpassword;
extern crate tokio;
extern crate tokio_smtp_session;

use std::io::{stdin, stdout, Write};

use futures::future::lazy;
use futures::Future;
use tokio_smtp_session::{FailureCode, Message, MessageId, RecipientKind, Session, SessionHandler};

/// prints every delivery outcome to stdout
struct Printer;

impl SessionHandler for Printer {
    fn on_encrypted(&mut self) {
        println!("[link is now TLS protected]");
    }

    fn on_authenticated(&mut self) {
        println!("[authenticated]");
    }

    fn on_mail_sent(&mut self, id: MessageId) {
        println!("[mail {} delivered]", id);
    }

    fn on_mail_failed(&mut self, id: MessageId, code: FailureCode, text: &str) {
        println!("[mail {} failed ({}): {}]", id, code, text);
    }

    fn on_connection_failed(&mut self, text: &str) {
        println!("[connection failed: {}]", text);
    }

    fn on_authentication_failed(&mut self, text: &str) {
        println!("[authentication failed: {}]", text);
    }

    fn on_finished(&mut self) {
        println!("[queue drained]");
    }
}

fn main() {
    env_logger::init();

    println!("preparing to send a test mail via ethereal.email");
    let sender = read_line("ethereal.email mail address: ");
    let password = rpassword::prompt_password_stdout("password: ").unwrap();

    let mut message = Message::new();
    message.set_sender(sender.clone());
    // ethereal does not deliver anything, any recipient works
    message.add_recipient(RecipientKind::To, "invalid@test.test");
    message.set_subject("am I spam?");
    message.set_body("probably.\n");

    let mut session = Session::new(Printer);
    session.set_username(sender);
    session.set_password(password);
    session.send(message);
    session
        .connect("smtp.ethereal.email", 587)
        .expect("resolving the host failed");

    println!("[starting tokio]");
    tokio::run(lazy(move || {
        session
            .drive()
            .and_then(|mut session| {
                session.quit();
                session.drive()
            })
            .map(|_session| ())
            .map_err(|err| eprintln!("[i/o error: {}]", err))
    }));
}

fn read_line(prompt: &str) -> String {
    let stdout = stdout();
    let mut handle = stdout.lock();
    write!(handle, "{}", prompt).unwrap();
    handle.flush().unwrap();

    let mut line = String::new();
    stdin().read_line(&mut line).unwrap();
    line.trim().to_owned()
}
