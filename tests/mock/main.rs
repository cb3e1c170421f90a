#[cfg(not(feature = "mock-impl"))]
compile_error!("integration tests require the \"mock-impl\" feature");

use tokio_smtp_session::io::Socket;
use tokio_smtp_session::mock::{ActionData, Actor, MockSocket};
use tokio_smtp_session::{ClientId, EventLog, Session};

mod session;

fn mock(conversation: Vec<(Actor, ActionData)>) -> Session<EventLog> {
    let socket = MockSocket::new(conversation);
    let mut session = Session::with_transport(EventLog::new(), Socket::Mock(Box::new(socket)));
    session.set_client_id(ClientId::Domain("me.test".to_owned()));
    session
}
