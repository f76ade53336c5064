#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub user: String,
    pub local: bool,
}

impl Endpoint {
    pub fn local() -> Self {
        Self {
            address: String::new(),
            user: String::new(),
            local: true,
        }
    }

    pub fn remote(address: impl Into<String>, user: impl Into<String>) -> Self {
        let address = address.into();
        let local = is_local_address(&address);
        Self {
            address,
            user: user.into(),
            local,
        }
    }
}

fn is_local_address(address: &str) -> bool {
    matches!(address, "" | "127.0.0.1" | "localhost" | "::1")
}
