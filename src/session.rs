//! startup and authentication handshake, run before the driver task starts.

use fallible_iterator::FallibleIterator;
use postgres_protocol::{
    authentication,
    authentication::sasl,
    message::{backend, frontend},
};
use xitca_io::{bytes::BytesMut, io::AsyncIo};

use super::{
    config::Config,
    driver::generic::GenericDriver,
    error::{ConfigError, DbError, Error, SqlState},
};

/// identity of the backend process serving this connection, captured from
/// BackendKeyData during the handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct Session {
    process_id: i32,
    secret_key: i32,
}

impl Session {
    /// process id of the backend session of this connection.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// secret key for out of band requests addressing this backend.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }
}

pub(crate) async fn prepare<Io>(drv: &mut GenericDriver<Io>, cfg: &Config) -> Result<Session, Error>
where
    Io: AsyncIo + Send,
{
    let mut buf = BytesMut::new();

    auth(drv, cfg, &mut buf).await?;

    let mut session = Session::default();

    loop {
        match drv.recv().await? {
            backend::Message::ReadyForQuery(_) => return Ok(session),
            backend::Message::BackendKeyData(body) => {
                session.process_id = body.process_id();
                session.secret_key = body.secret_key();
            }
            backend::Message::ParameterStatus(_) | backend::Message::NoticeResponse(_) => {}
            backend::Message::ErrorResponse(body) => return Err(Error::db(body.fields())),
            _ => return Err(Error::unexpected()),
        }
    }
}

async fn auth<Io>(drv: &mut GenericDriver<Io>, cfg: &Config, buf: &mut BytesMut) -> Result<(), Error>
where
    Io: AsyncIo + Send,
{
    let mut params = vec![("client_encoding", "UTF8")];
    if let Some(user) = cfg.get_user() {
        params.push(("user", user));
    }
    if let Some(dbname) = cfg.get_dbname() {
        params.push(("database", dbname));
    }
    if let Some(options) = cfg.get_options() {
        params.push(("options", options));
    }
    if let Some(application_name) = cfg.get_application_name() {
        params.push(("application_name", application_name));
    }

    frontend::startup_message(params, buf)?;
    drv.send(buf.split()).await?;

    loop {
        match drv.recv().await? {
            backend::Message::AuthenticationOk => return Ok(()),
            backend::Message::AuthenticationCleartextPassword => {
                let pass = cfg.get_password().ok_or(ConfigError::MissingPassword)?;
                send_password(drv, pass, buf).await?;
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let pass = cfg.get_password().ok_or(ConfigError::MissingPassword)?;
                let user = cfg.get_user().ok_or(ConfigError::MissingUser)?.as_bytes();
                let pass = authentication::md5_hash(user, pass, body.salt());
                send_password(drv, pass, buf).await?;
            }
            backend::Message::AuthenticationSasl(body) => {
                let pass = cfg.get_password().ok_or(ConfigError::MissingPassword)?;

                // without tls there is no channel binding to offer, leaving
                // plain SCRAM-SHA-256 as the only mechanism spoken here.
                let mut has_scram = false;
                let mut mechanisms = body.mechanisms();
                while let Some(mechanism) = mechanisms.next()? {
                    if mechanism == sasl::SCRAM_SHA_256 {
                        has_scram = true;
                    }
                }
                if !has_scram {
                    return Err(ConfigError::UnsupportedAuthentication.into());
                }

                let mut scram = sasl::ScramSha256::new(pass, sasl::ChannelBinding::unrequested());

                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), buf)?;
                drv.send(buf.split()).await?;

                match drv.recv().await? {
                    backend::Message::AuthenticationSaslContinue(body) => {
                        scram.update(body.data())?;
                        frontend::sasl_response(scram.message(), buf)?;
                        drv.send(buf.split()).await?;
                    }
                    backend::Message::ErrorResponse(body) => return Err(auth_error(body.fields())),
                    _ => return Err(Error::unexpected()),
                }

                match drv.recv().await? {
                    backend::Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
                    backend::Message::ErrorResponse(body) => return Err(auth_error(body.fields())),
                    _ => return Err(Error::unexpected()),
                }
            }
            backend::Message::ErrorResponse(body) => return Err(auth_error(body.fields())),
            backend::Message::NoticeResponse(_) => {}
            _ => return Err(ConfigError::UnsupportedAuthentication.into()),
        }
    }
}

async fn send_password<Io>(drv: &mut GenericDriver<Io>, pass: impl AsRef<[u8]>, buf: &mut BytesMut) -> Result<(), Error>
where
    Io: AsyncIo + Send,
{
    frontend::password_message(pass.as_ref(), buf)?;
    drv.send(buf.split()).await
}

// a credential rejection surfaces as a config error; anything else keeps
// the server diagnostics.
fn auth_error(fields: backend::ErrorFields<'_>) -> Error {
    let e = Error::db(fields);
    match e.downcast_ref::<DbError>() {
        Some(db) if SqlState::INVALID_PASSWORD.eq(db.code()) => ConfigError::WrongPassword.into(),
        _ => e,
    }
}
