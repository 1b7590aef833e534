use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// Caller handed us something that cannot be turned into a valid operation:
/// a malformed device path, an unparseable disk image, an unsupported format.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Input image at '{path}' does not match a supported format")]
    UnrecognizedImageFormat { path: String },
    #[error("Partition '{id}' was not found in the disk topology")]
    UnknownPartition { id: String },
    #[error("Mount point '{path}' is not declared by any partition")]
    UnknownMountPoint { path: String },
}

/// Converting between on-disk image formats (raw, qcow2, vhd(x), COSI) failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ImageConversionError {
    #[error("Failed to attach '{path}' as a loop device")]
    LoopbackAttach { path: String },
    #[error("Failed to detach loop device '{device}'")]
    LoopbackDetach { device: String },
    #[error("Failed to convert image to '{format}'")]
    Convert { format: String },
    #[error("Failed to extract partition '{index}' from disk")]
    ExtractPartition { index: u32 },
    #[error("Failed to pack COSI archive")]
    CosiPack,
    #[error("Failed to read COSI metadata")]
    CosiMetadata,
}

/// A filesystem-level operation (resize, UUID reset, fsck) failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemOperationError {
    #[error("Failed to mount '{device}' at '{mount_point}'")]
    Mount { device: String, mount_point: String },
    #[error("Failed to unmount '{mount_point}'")]
    Unmount { mount_point: String },
    #[error("Failed to enter chroot at '{path}'")]
    ChrootEnter { path: String },
    #[error("Failed to exit chroot")]
    ChrootExit,
    #[error("Filesystem check failed for '{device}'")]
    Fsck { device: String },
    #[error("Failed to shrink filesystem on '{device}'")]
    Shrink { device: String },
    #[error("Failed to reset UUID for filesystem on '{device}'")]
    ResetFilesystemUuid { device: String },
    #[error("Failed to reset UUID for partition '{device}'")]
    ResetPartitionUuid { device: String },
    #[error("Failed to rewrite fstab entry for '{mount_point}'")]
    RewriteFstab { mount_point: String },
    #[error("Unsupported filesystem type '{fs_type}'")]
    UnsupportedFilesystem { fs_type: String },
    #[error("Failed to resolve disk topology from inherited fstab")]
    TopologyResolution,
}

/// Reserved for interactions with the package manager. The engine itself never
/// invokes a package manager, but downstream callers may report failures from
/// their own package-management step through this category.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManagementError {
    #[error("Package operation '{operation}' failed")]
    OperationFailed { operation: String },
}

/// Reserved for script/hook execution performed by a caller of this engine.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptExecutionError {
    #[error("Script '{path}' exited with a non-zero status")]
    NonZeroExit { path: String },
}

/// An uncategorized error occurred or a bug was encountered. This indicates a
/// problem with the engine itself rather than with its input.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalSystemError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("An uncategorized error occurred: {0}")]
    Todo(&'static str),
    #[error("Failed to run external command '{command}'")]
    CommandFailed { command: String },
    #[error("Resource guard '{resource}' was dropped without being released cleanly")]
    UngracefulResourceDrop { resource: String },
    #[error("Not implemented: {reason}")]
    NotImplemented { reason: String },
}

/// A requested operation is gated behind a feature that is not enabled in
/// this build, or is explicitly out of scope for this engine.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureGateError {
    #[error("Feature '{feature}' is not supported by this build")]
    Unsupported { feature: &'static str },
}

/// Each variant of `ErrorKind` corresponds to a different category of error. The categories are
/// intended to be user-meaningful and to be used for routing issues to the right place.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    ImageConversion(#[from] ImageConversionError),

    #[error(transparent)]
    FilesystemOperation(#[from] FilesystemOperationError),

    #[error(transparent)]
    PackageManagement(#[from] PackageManagementError),

    #[error(transparent)]
    ScriptExecution(#[from] ScriptExecutionError),

    #[error(transparent)]
    Internal(#[from] InternalSystemError),

    #[error(transparent)]
    FeatureGate(#[from] FeatureGateError),
}

#[derive(Debug)]
struct ImageCustomizerErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// Top level error type for the image customization engine. Carries a
/// structured [`ErrorKind`], the call site that raised it, and any chained
/// context attached on the way up the stack via [`ImageCustomizerResultExt::message`].
pub struct ImageCustomizerError(Box<ImageCustomizerErrorInner>);

impl ImageCustomizerError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        ImageCustomizerError(Box::new(ImageCustomizerErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: ImageCustomizerError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured ImageCustomizerError.
    fn structured(self, kind: K) -> Result<T, ImageCustomizerError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ImageCustomizerError> {
        match self {
            Some(t) => Ok(t),
            None => Err(ImageCustomizerError(Box::new(ImageCustomizerErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ImageCustomizerError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(ImageCustomizerError(Box::new(ImageCustomizerErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait ImageCustomizerResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, ImageCustomizerError>;

    /// Convert the error into an unstructured error, dropping its structured kind.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> ImageCustomizerResultExt<T> for Result<T, ImageCustomizerError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, ImageCustomizerError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for ImageCustomizerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("image-customizer-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::ImageConversion(ref e) => state.serialize_field("error", e)?,
            ErrorKind::FilesystemOperation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::PackageManagement(ref e) => state.serialize_field("error", e)?,
            ErrorKind::ScriptExecution(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
            ErrorKind::FeatureGate(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for ImageCustomizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
