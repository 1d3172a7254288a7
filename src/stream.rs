//! TCP (and optionally TLS) transport for driver connections.
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(feature = "ssl")]
use openssl::ssl::{Ssl, SslContext, SslMethod, SslStream, SSL_OP_NO_COMPRESSION, SSL_OP_NO_SSLV2,
                   SSL_OP_NO_SSLV3, SSL_VERIFY_NONE, SSL_VERIFY_PEER};
#[cfg(feature = "ssl")]
use openssl::x509::X509_FILETYPE_PEM;

use crate::connstring::Host;
use crate::error::{Error, Result};

/// Encapsulates the functionality for how to connect to the server.
#[derive(Clone, Debug, Default)]
pub struct StreamConnector {
    pub connect_timeout: Option<Duration>,
    pub keep_alive: bool,
    #[cfg(feature = "ssl")]
    pub ssl: Option<SslConfig>,
}

/// Certificate material for TLS connections.
///
/// It's invalid to set one of `certificate_file` and `key_file` without the
/// other.
#[cfg(feature = "ssl")]
#[derive(Clone, Debug)]
pub struct SslConfig {
    pub ca_file: String,
    pub certificate_file: Option<String>,
    pub key_file: Option<String>,
    pub verify_peer: bool,
}

impl StreamConnector {
    pub fn new(connect_timeout: Option<Duration>, keep_alive: bool) -> StreamConnector {
        StreamConnector {
            connect_timeout: connect_timeout,
            keep_alive: keep_alive,
            #[cfg(feature = "ssl")]
            ssl: None,
        }
    }

    /// Opens a stream to `host`, honoring the connect timeout.
    pub fn connect(&self, host: &Host) -> Result<Stream> {
        let tcp = self.connect_tcp(host)?;

        if self.keep_alive {
            let sock = socket2::SockRef::from(&tcp);
            sock.set_keepalive(true).map_err(
                |e| Error::SocketError(host.clone(), e),
            )?;
        }

        self.wrap(tcp, host)
    }

    fn connect_tcp(&self, host: &Host) -> Result<TcpStream> {
        let timeout = match self.connect_timeout {
            Some(t) if t > Duration::from_millis(0) => t,
            _ => {
                return TcpStream::connect((&host.host_name[..], host.port)).map_err(|e| {
                    Error::SocketError(host.clone(), e)
                })
            }
        };

        let addrs = (&host.host_name[..], host.port)
            .to_socket_addrs()
            .map_err(|e| Error::SocketError(host.clone(), e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        match last_err {
            Some(ref err)
                if err.kind() == io::ErrorKind::TimedOut ||
                       err.kind() == io::ErrorKind::WouldBlock => {
                Err(Error::SocketOpenTimeout(host.clone()))
            }
            Some(err) => Err(Error::SocketError(host.clone(), err)),
            None => Err(Error::SocketError(
                host.clone(),
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
            )),
        }
    }

    #[cfg(not(feature = "ssl"))]
    fn wrap(&self, tcp: TcpStream, _host: &Host) -> Result<Stream> {
        Ok(Stream::Tcp(tcp))
    }

    #[cfg(feature = "ssl")]
    fn wrap(&self, tcp: TcpStream, host: &Host) -> Result<Stream> {
        let config = match self.ssl {
            Some(ref config) => config,
            None => return Ok(Stream::Tcp(tcp)),
        };

        let err = |e| Error::SocketError(host.clone(), io::Error::new(io::ErrorKind::Other, e));

        let mut ssl_context = SslContext::builder(SslMethod::tls()).map_err(err)?;
        ssl_context
            .set_cipher_list("ALL:!EXPORT:!eNULL:!aNULL:HIGH:@STRENGTH")
            .map_err(err)?;
        ssl_context.set_options(SSL_OP_NO_SSLV2);
        ssl_context.set_options(SSL_OP_NO_SSLV3);
        ssl_context.set_options(SSL_OP_NO_COMPRESSION);
        ssl_context.set_ca_file(&config.ca_file).map_err(err)?;
        if let Some(ref file) = config.certificate_file {
            ssl_context
                .set_certificate_file(file, X509_FILETYPE_PEM)
                .map_err(err)?;
        }
        if let Some(ref file) = config.key_file {
            ssl_context
                .set_private_key_file(file, X509_FILETYPE_PEM)
                .map_err(err)?;
        }

        let verify = if config.verify_peer {
            SSL_VERIFY_PEER
        } else {
            SSL_VERIFY_NONE
        };
        ssl_context.set_verify(verify);

        let mut ssl = Ssl::new(&ssl_context.build()).map_err(err)?;
        ssl.set_hostname(&host.host_name).map_err(err)?;

        match ssl.connect(tcp) {
            Ok(s) => Ok(Stream::Ssl(s)),
            Err(e) => Err(Error::SocketError(
                host.clone(),
                io::Error::new(io::ErrorKind::Other, e),
            )),
        }
    }
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "ssl")]
    Ssl(SslStream<TcpStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match *self {
            Stream::Tcp(ref stream) => stream,
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref stream) => stream.get_ref(),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_write_timeout(timeout)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.flush(),
        }
    }
}
