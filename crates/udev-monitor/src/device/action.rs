use std::{convert::Infallible, fmt, str::FromStr};

macro_rules! define_actions {
  (
    pub enum $name:ident {
      $($case:ident = $val:literal),+
      $(,)?
    }
  ) => {
    /// The verb of a monitor event.
    ///
    /// The kernel may introduce new verbs over time, those are kept verbatim in
    /// [`Action::Unknown`].
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum $name {
      $($case,)+
      Unknown(String),
    }

    impl $name {
      pub fn as_str(&self) -> &str {
        match self {
          $(Self::$case => $val,)+
          Self::Unknown(action) => action,
        }
      }
    }

    impl From<&str> for $name {
      fn from(value: &str) -> Self {
        match value {
          $($val => Self::$case,)+
          other => Self::Unknown(other.into()),
        }
      }
    }
  };
}

define_actions! {
  pub enum Action {
    Add = "add",
    Remove = "remove",
    Change = "change",
    Move = "move",
    Online = "online",
    Offline = "offline",
    Bind = "bind",
    Unbind = "unbind",
  }
}

impl FromStr for Action {
  type Err = Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self::from(s))
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
